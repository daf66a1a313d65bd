use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::StorePath;

#[derive(Debug, Clone)]
pub struct Output {
    pub name: String,
    pub path: StorePath,
}

#[derive(Debug, Clone)]
pub struct DerivationEnv {
    inner: HashMap<String, String>,
}

impl DerivationEnv {
    #[must_use]
    pub const fn new(v: HashMap<String, String>) -> Self {
        Self { inner: v }
    }

    #[must_use]
    pub fn get(&self, k: &str) -> Option<&str> {
        self.inner
            .get(k)
            .and_then(|v| if v.is_empty() { None } else { Some(v.as_str()) })
    }

    #[must_use]
    pub fn get_required_system_features(&self) -> Vec<&str> {
        self.get("requiredSystemFeatures")
            .unwrap_or_default()
            .split_whitespace()
            .collect()
    }

    #[must_use]
    pub fn get_prefer_local_build(&self) -> bool {
        self.get("preferLocalBuild") == Some("1")
    }
}

/// An immutable build recipe. Identified by its store path; produces one or
/// more output paths and depends on the outputs of other recipes.
#[derive(Debug, Clone)]
pub struct Derivation {
    pub env: DerivationEnv,
    pub input_drvs: SmallVec<[StorePath; 8]>,
    pub outputs: SmallVec<[Output; 6]>,
    pub platform: String,
    pub drv_path: StorePath,
}

/// Recipe wire format: a JSON document stored at the recipe's store path.
#[derive(serde::Deserialize)]
struct RecipeDoc {
    platform: String,
    #[serde(default)]
    outputs: std::collections::BTreeMap<String, String>,
    #[serde(default, rename = "inputDrvs")]
    input_drvs: std::collections::BTreeMap<String, Vec<String>>,
    #[serde(default)]
    env: std::collections::BTreeMap<String, String>,
}

impl Derivation {
    fn new(drv_path: &StorePath, doc: RecipeDoc) -> Self {
        Self {
            env: DerivationEnv::new(doc.env.into_iter().collect()),
            input_drvs: doc
                .input_drvs
                .into_keys()
                .map(|p| StorePath::new(&p))
                .collect(),
            outputs: doc
                .outputs
                .into_iter()
                .map(|(name, path)| Output {
                    name,
                    path: StorePath::new(&path),
                })
                .collect(),
            platform: doc.platform,
            drv_path: drv_path.clone(),
        }
    }
}

pub(crate) fn parse_drv(drv_path: &StorePath, input: &str) -> Result<Derivation, crate::Error> {
    let doc: RecipeDoc =
        serde_json::from_str(input).map_err(|e| crate::Error::Parse(drv_path.clone(), e))?;
    Ok(Derivation::new(drv_path, doc))
}
