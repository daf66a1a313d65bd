use std::sync::Arc;

use super::Step;

/// A builder machine as declared in the config file. Registration happens
/// once at startup (and on config reload); the build protocol itself is the
/// builder pool's concern.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub hostname: String,
    pub systems: Vec<String>,
    #[serde(default)]
    pub supported_features: Vec<String>,
    #[serde(default)]
    pub mandatory_features: Vec<String>,
}

impl std::fmt::Display for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Machine: [hostname={} systems={:?} supported_features={:?} mandatory_features={:?}]",
            self.hostname, self.systems, self.supported_features, self.mandatory_features,
        )
    }
}

impl Machine {
    fn supports_all_features(&self, features: &[String]) -> bool {
        features.iter().all(|f| self.supported_features.contains(f))
    }

    fn supports_step(&self, step: &Arc<Step>) -> bool {
        let Some(platform) = step.get_platform() else {
            return false;
        };
        let required = step.get_required_features();
        (platform == "builtin" || self.systems.contains(&platform))
            && self
                .mandatory_features
                .iter()
                .all(|f| required.contains(f))
            && self.supports_all_features(&required)
    }
}

pub struct Machines {
    inner: parking_lot::RwLock<Vec<Arc<Machine>>>,
}

impl Default for Machines {
    fn default() -> Self {
        Self::new()
    }
}

impl Machines {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: parking_lot::RwLock::new(Vec::new()),
        }
    }

    pub fn replace_all(&self, machines: Vec<Machine>) {
        let mut inner = self.inner.write();
        *inner = machines.into_iter().map(Arc::new).collect();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Whether any registered machine can run the step.
    pub fn support_step(&self, step: &Arc<Step>) -> bool {
        let inner = self.inner.read();
        inner.iter().any(|m| m.supports_step(step))
    }
}
