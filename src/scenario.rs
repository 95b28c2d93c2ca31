//! Scenario store: the named themes that drive every generation request, plus
//! the process-wide "active" selection.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use include_dir::{include_dir, Dir};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::{error::StoreError, models::Scenario};

static BUILTIN_SCENARIOS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/scenarios");

const MAX_ID_LEN: usize = 64;

/// Scenarios shipped inside the binary. Seeded into an empty scenario directory.
pub fn builtin_scenarios() -> Vec<Scenario> {
    let mut scenarios: Vec<Scenario> = BUILTIN_SCENARIOS
        .files()
        .filter(|f| f.path().extension().is_some_and(|ext| ext == "json"))
        .filter_map(|f| match serde_json::from_slice::<Scenario>(f.contents()) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Skipping malformed builtin scenario {}: {}", f.path().display(), e);
                None
            }
        })
        .collect();
    scenarios.sort_by(|a, b| a.id.cmp(&b.id));
    scenarios
}

pub fn validate(scenario: &Scenario) -> Result<(), StoreError> {
    validate_id(&scenario.id)?;
    if scenario.short_description.trim().is_empty() {
        return Err(StoreError::Invalid("short description must not be empty".into()));
    }
    if scenario.full_description.trim().is_empty() {
        return Err(StoreError::Invalid("full description must not be empty".into()));
    }
    Ok(())
}

/// Ids double as file names, so they are restricted to `[A-Za-z0-9_-]`.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(StoreError::Invalid(format!("id must be 1..={MAX_ID_LEN} characters")));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(StoreError::Invalid(format!(
            "id {id:?} may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

pub struct ScenarioStore {
    scenarios: RwLock<BTreeMap<String, Scenario>>,
    active: RwLock<String>,
    dir: Option<PathBuf>,
}

impl ScenarioStore {
    /// Store without disk persistence.
    pub fn in_memory(scenarios: Vec<Scenario>, preferred_active: &str) -> Result<Self, StoreError> {
        let mut map = BTreeMap::new();
        for scenario in scenarios {
            validate(&scenario)?;
            if map.contains_key(&scenario.id) {
                return Err(StoreError::Conflict(scenario.id));
            }
            map.insert(scenario.id.clone(), scenario);
        }
        Self::build(map, preferred_active, None)
    }

    /// Loads every `*.json` scenario in `dir`, seeding the builtin scenarios first
    /// when the directory holds none. Files that fail to parse are skipped.
    pub fn open(dir: impl Into<PathBuf>, preferred_active: &str) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        if json_files(&dir)?.is_empty() {
            info!("🌱 Seeding builtin scenarios into {}", dir.display());
            for scenario in builtin_scenarios() {
                std::fs::write(scenario_file(&dir, &scenario.id), serde_json::to_vec_pretty(&scenario)?)?;
            }
        }

        let mut map = BTreeMap::new();
        for path in json_files(&dir)? {
            let parsed = std::fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|bytes| serde_json::from_slice::<Scenario>(&bytes).map_err(StoreError::from))
                .and_then(|s| validate(&s).map(|_| s));
            match parsed {
                Ok(scenario) => {
                    map.insert(scenario.id.clone(), scenario);
                }
                Err(e) => warn!("Skipping scenario file {}: {}", path.display(), e),
            }
        }

        info!("📚 Loaded {} scenarios from {}", map.len(), dir.display());
        Self::build(map, preferred_active, Some(dir))
    }

    fn build(
        map: BTreeMap<String, Scenario>,
        preferred_active: &str,
        dir: Option<PathBuf>,
    ) -> Result<Self, StoreError> {
        let active = if map.contains_key(preferred_active) {
            preferred_active.to_string()
        } else {
            let first = map
                .keys()
                .next()
                .cloned()
                .ok_or_else(|| StoreError::Invalid("no scenarios available".into()))?;
            warn!("Scenario '{}' not found, activating '{}' instead", preferred_active, first);
            first
        };
        Ok(Self { scenarios: RwLock::new(map), active: RwLock::new(active), dir })
    }

    pub fn list(&self) -> Vec<Scenario> {
        self.scenarios.read().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Scenario> {
        self.scenarios.read().get(id).cloned()
    }

    pub fn active_id(&self) -> String {
        self.active.read().clone()
    }

    pub fn get_active(&self) -> Scenario {
        let id = self.active_id();
        // Scenarios are never removed, so the active id always resolves.
        self.scenarios
            .read()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Scenario::new(id, "", ""))
    }

    pub fn set_active(&self, id: &str) -> Result<(), StoreError> {
        if !self.scenarios.read().contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        *self.active.write() = id.to_string();
        info!("🔀 Active scenario is now '{}'", id);
        Ok(())
    }

    /// Adds a new scenario. An existing id yields `Conflict` and leaves the stored entry untouched.
    pub async fn add(&self, scenario: Scenario) -> Result<(), StoreError> {
        validate(&scenario)?;
        {
            let mut guard = self.scenarios.write();
            if guard.contains_key(&scenario.id) {
                return Err(StoreError::Conflict(scenario.id));
            }
            guard.insert(scenario.id.clone(), scenario.clone());
        }

        if let Err(e) = self.persist(&scenario).await {
            self.scenarios.write().remove(&scenario.id);
            return Err(e);
        }
        info!("➕ Added scenario '{}'", scenario.id);
        Ok(())
    }

    /// Explicit admin edit of the descriptions of an existing scenario.
    pub async fn edit(
        &self,
        id: &str,
        short_description: String,
        full_description: String,
    ) -> Result<Scenario, StoreError> {
        let updated = Scenario { id: id.to_string(), short_description, full_description };
        validate(&updated)?;
        let previous = {
            let mut guard = self.scenarios.write();
            let entry = guard.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            std::mem::replace(entry, updated.clone())
        };

        if let Err(e) = self.persist(&updated).await {
            self.scenarios.write().insert(id.to_string(), previous);
            return Err(e);
        }
        info!("✏️ Edited scenario '{}'", id);
        Ok(updated)
    }

    async fn persist(&self, scenario: &Scenario) -> Result<(), StoreError> {
        let Some(dir) = &self.dir else { return Ok(()) };
        let bytes = serde_json::to_vec_pretty(scenario)?;
        tokio::fs::write(scenario_file(dir, &scenario.id), bytes).await?;
        Ok(())
    }
}

fn scenario_file(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.json"))
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
