use std::{collections::HashMap, sync::Arc};

use pt::DbType;

use crate::{
    error::CdcError, Connector, ConnectorOptions, Dumper, DumperOptions, Reader, ReaderOptions,
    SchemaManager, Writer, WriterOptions,
};

/// A database integration. Each capability is optional; a plugin that
/// cannot act as, say, a reader returns `None` from [`Plugin::reader`].
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn connector(&self, _opts: ConnectorOptions) -> Option<Box<dyn Connector>> {
        None
    }

    fn schema_manager(&self, _opts: ConnectorOptions) -> Option<Arc<dyn SchemaManager>> {
        None
    }

    fn reader(&self, _opts: ReaderOptions) -> Option<Box<dyn Reader>> {
        None
    }

    fn writer(&self, _opts: WriterOptions) -> Option<Box<dyn Writer>> {
        None
    }

    fn dumper(&self, _opts: DumperOptions) -> Option<Box<dyn Dumper>> {
        None
    }
}

/// Plugins keyed by connector type. Built once at startup and handed to
/// the runtime; tests build their own.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<DbType, Arc<dyn Plugin>>,
}

fn missing_capability(db_type: DbType, capability: &str) -> anyhow::Error {
    CdcError::configuration(format!(
        "plugin {} does not support the {} protocol",
        db_type, capability
    ))
    .into()
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, db_type: DbType, plugin: Arc<dyn Plugin>) {
        tracing::debug!("registering plugin {} for {}", plugin.name(), db_type);
        self.plugins.insert(db_type, plugin);
    }

    pub fn get(&self, db_type: DbType) -> anyhow::Result<Arc<dyn Plugin>> {
        self.plugins
            .get(&db_type)
            .cloned()
            .ok_or_else(|| {
                CdcError::configuration(format!("can not find plugin {}", db_type)).into()
            })
    }

    pub fn connector(&self, opts: ConnectorOptions) -> anyhow::Result<Box<dyn Connector>> {
        let db_type = opts.connector.db_type;
        self.get(db_type)?
            .connector(opts)
            .ok_or_else(|| missing_capability(db_type, "connector"))
    }

    pub fn schema_manager(&self, opts: ConnectorOptions) -> anyhow::Result<Arc<dyn SchemaManager>> {
        let db_type = opts.connector.db_type;
        self.get(db_type)?
            .schema_manager(opts)
            .ok_or_else(|| missing_capability(db_type, "schema"))
    }

    pub fn reader(&self, opts: ReaderOptions) -> anyhow::Result<Box<dyn Reader>> {
        let db_type = opts.connector.db_type;
        self.get(db_type)?
            .reader(opts)
            .ok_or_else(|| missing_capability(db_type, "reader"))
    }

    pub fn writer(&self, opts: WriterOptions) -> anyhow::Result<Box<dyn Writer>> {
        let db_type = opts.connector.db_type;
        self.get(db_type)?
            .writer(opts)
            .ok_or_else(|| missing_capability(db_type, "writer"))
    }

    pub fn dumper(&self, opts: DumperOptions) -> anyhow::Result<Box<dyn Dumper>> {
        let db_type = opts.connector.db_type;
        self.get(db_type)?
            .dumper(opts)
            .ok_or_else(|| missing_capability(db_type, "dumper"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    struct WriteOnly;

    impl Plugin for WriteOnly {
        fn name(&self) -> &str {
            "write-only"
        }
    }

    fn connector(db_type: DbType) -> pt::Connector {
        pt::Connector {
            id: "c1".to_string(),
            name: "c1".to_string(),
            db_type,
            target_type: Default::default(),
            host: "localhost".to_string(),
            port: 0,
            username: String::new(),
            password: String::new(),
            database: "db".to_string(),
        }
    }

    #[test]
    fn unknown_plugins_are_configuration_errors() {
        let registry = PluginRegistry::new();
        let err = registry.get(DbType::Elasticsearch).err().unwrap();
        assert!(matches!(classify(&err), Some(CdcError::Configuration { .. })));
    }

    #[test]
    fn missing_capabilities_are_configuration_errors() {
        let mut registry = PluginRegistry::new();
        registry.register(DbType::MySql, Arc::new(WriteOnly));
        let err = registry
            .schema_manager(ConnectorOptions {
                connector: connector(DbType::MySql),
            })
            .err()
            .unwrap();
        assert!(err.to_string().contains("schema"));
        assert!(matches!(classify(&err), Some(CdcError::Configuration { .. })));
    }
}
