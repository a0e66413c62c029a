use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TypeError {
    #[snafu(display("cannot parse '{}' as {}", input, target))]
    Parse { input: String, target: &'static str },

    #[snafu(display("{} encoder does not accept {} values", target, kind))]
    Unsupported {
        target: &'static str,
        kind: &'static str,
    },

    #[snafu(display("invalid json: {}", source))]
    Json { source: serde_json::Error },
}
