use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::common::config::Config;
use crate::common::interface::{Parser, StoragePipeline};
use crate::dedup::DedupFilter;
use crate::errors::{Error, ErrorKind, Result};

type Factory<T> = Arc<dyn Fn(&Config) -> Result<Arc<T>> + Send + Sync>;

/// String key to constructor map. Lets configuration name parsers,
/// pipelines and dedup filters that code registered up front.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    factories: DashMap<String, Factory<T>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: DashMap::new(),
        }
    }

    /// Registers `factory` under `name`, replacing an earlier registration.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Config) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn build(&self, name: &str, config: &Config) -> Result<Arc<T>> {
        // clone the factory out so the shard lock is not held while it runs
        let factory = self
            .factories
            .get(name)
            .map(|f| f.value().clone())
            .ok_or_else(|| Error::msg(ErrorKind::Config, format!("unknown {} '{}'", self.kind, name)))?;
        factory(config)
    }
}

pub type ParserRegistry = Registry<dyn Parser>;
pub type PipelineRegistry = Registry<dyn StoragePipeline>;
pub type FilterRegistry = Registry<dyn DedupFilter>;

/// Parsers of a running job, resolved by `Request::parser_name`.
#[derive(Clone, Default)]
pub struct ParserSet {
    ordered: Vec<Arc<dyn Parser>>,
    by_name: HashMap<String, Arc<dyn Parser>>,
}

impl ParserSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, parser: Arc<dyn Parser>) {
        let name = parser.name().to_string();
        if let Some(pos) = self.ordered.iter().position(|p| p.name() == name) {
            self.ordered[pos] = parser.clone();
        } else {
            self.ordered.push(parser.clone());
        }
        self.by_name.insert(name, parser);
    }

    /// A request without a parser name goes to the first parser added.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn Parser>> {
        match name {
            Some(name) => self
                .by_name
                .get(name)
                .cloned()
                .ok_or_else(|| Error::parser_not_found(name)),
            None => self
                .ordered
                .first()
                .cloned()
                .ok_or_else(|| Error::parser_not_found("<none registered>")),
        }
    }

    pub fn all(&self) -> &[Arc<dyn Parser>] {
        &self.ordered
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }
}

impl std::fmt::Debug for ParserSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.ordered.iter().map(|p| p.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::interface::ConsolePipeline;
    use crate::common::model::{Request, Response, YieldStream, empty};

    struct Named(&'static str);

    impl Parser for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn parse<'a>(&'a self, _request: &'a Request, _response: &'a Response) -> YieldStream<'a> {
            empty()
        }
    }

    #[test]
    fn test_pipeline_registry_builds_by_name() {
        let registry = PipelineRegistry::new("pipeline");
        registry.register("console", |_cfg| Ok(Arc::new(ConsolePipeline) as Arc<dyn StoragePipeline>));
        let config = Config::new("job");
        assert!(registry.contains("console"));
        assert_eq!(registry.build("console", &config).unwrap().name(), "console");

        let err = registry.build("mysql", &config).err().unwrap();
        assert!(err.to_string().contains("unknown pipeline 'mysql'"));
    }

    #[test]
    fn test_parser_set_resolution() {
        let mut set = ParserSet::new();
        assert!(set.resolve(None).is_err());
        set.add(Arc::new(Named("list")));
        set.add(Arc::new(Named("detail")));
        assert_eq!(set.resolve(None).unwrap().name(), "list");
        assert_eq!(set.resolve(Some("detail")).unwrap().name(), "detail");
        assert!(set.resolve(Some("missing")).is_err());
        assert_eq!(set.len(), 2);
    }
}
