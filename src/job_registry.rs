use crate::errors::RegistryError;
use crate::source::Source;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

type SourceFactoryFn =
    Arc<dyn Fn(&Value) -> Result<Box<dyn Source>, RegistryError> + Send + Sync>;

/// Maps job type names to source factories.
///
/// Built once during startup and handed to the [`Runner`](crate::Runner)
/// behind an `Arc`. Registering a name twice replaces the earlier factory.
#[derive(Clone, Default)]
pub struct JobRegistry {
    entries: BTreeMap<String, SourceFactoryFn>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.list_names())
            .finish()
    }
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory that builds a source from the raw job query.
    ///
    /// The factory must be deterministic: the same query has to yield a
    /// source that resumes to the same upstream position.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> anyhow::Result<Box<dyn Source>> + Send + Sync + 'static,
    {
        let name = name.into();
        let job_type = name.clone();
        let factory: SourceFactoryFn = Arc::new(move |query| {
            factory(query).map_err(|source| RegistryError::Construction {
                job_type: job_type.clone(),
                source,
            })
        });
        self.entries.insert(name, factory);
        self
    }

    /// Register a factory taking typed parameters deserialized from the job query.
    ///
    /// Declare `P` with `#[serde(deny_unknown_fields)]` to reject queries
    /// carrying fields the source does not understand.
    pub fn register_with_params<P, S, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        P: DeserializeOwned,
        S: Source + 'static,
        F: Fn(P) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        let name = name.into();
        let job_type = name.clone();
        let factory: SourceFactoryFn = Arc::new(move |query| {
            let params = P::deserialize(query).map_err(|source| RegistryError::InvalidParams {
                job_type: job_type.clone(),
                source,
            })?;
            let source = factory(params).map_err(|source| RegistryError::Construction {
                job_type: job_type.clone(),
                source,
            })?;
            Ok(Box::new(source) as Box<dyn Source>)
        });
        self.entries.insert(name, factory);
        self
    }

    /// Build the source registered under `name` for the given job query.
    pub fn get(&self, name: &str, query: &Value) -> Result<Box<dyn Source>, RegistryError> {
        let factory = self
            .entries
            .get(name)
            .ok_or_else(|| RegistryError::UnknownSource(name.to_string()))?;
        factory(query)
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// All registered job type names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}
