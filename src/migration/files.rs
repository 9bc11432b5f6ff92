//! Discovery of numbered migration scripts.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Arc, LazyLock, RwLock};

use regex::Regex;

use crate::error::{DbQueueError, MigrationStage};

/// Prefix marking a migration set that lives in memory rather than on disk.
pub const PAYLOAD_PREFIX: &str = "PAYLOAD:";
/// File name of the optional module scripts may `import "database"`.
pub const SHARED_MODULE_FILE: &str = "database.rhai";

static SCRIPT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<design>.+)_(?P<number>[0-9]{1,6})\.rhai$").expect("valid script pattern")
});

/// One numbered script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub number: i64,
    pub name: String,
    pub source: String,
}

/// The scripts of one design, ordered by number.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    design: String,
    files: BTreeMap<i64, MigrationFile>,
    shared_module: Option<String>,
}

/// Split `<design>_<N>.rhai` into its design and number.
#[must_use]
pub fn parse_script_name(name: &str) -> Option<(&str, i64)> {
    let caps = SCRIPT_NAME.captures(name)?;
    let design = caps.name("design")?.as_str();
    let number = caps.name("number")?.as_str().parse().ok()?;
    Some((design, number))
}

impl MigrationSet {
    #[must_use]
    pub fn new(design: impl Into<String>) -> Self {
        Self {
            design: design.into(),
            ..Self::default()
        }
    }

    /// Add a script named `<design>_<N>.rhai`.
    ///
    /// # Errors
    /// Returns a `File`-stage [`DbQueueError::MigrationError`] if the name does not follow the
    /// pattern, belongs to another design, or repeats a number.
    pub fn add_script(
        &mut self,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<(), DbQueueError> {
        let name = name.into();
        let Some((design, number)) = parse_script_name(&name) else {
            return Err(DbQueueError::migration(
                MigrationStage::File,
                format!("'{name}' is not a migration script name"),
            ));
        };
        if design != self.design {
            return Err(DbQueueError::migration(
                MigrationStage::File,
                format!("'{name}' does not belong to design '{}'", self.design),
            ));
        }
        if self.files.contains_key(&number) {
            return Err(DbQueueError::migration(
                MigrationStage::File,
                format!("migration {number} is defined twice in '{}'", self.design),
            ));
        }
        self.files.insert(
            number,
            MigrationFile {
                number,
                name,
                source: source.into(),
            },
        );
        Ok(())
    }

    /// # Errors
    /// As [`MigrationSet::add_script`].
    pub fn with_script(mut self, name: &str, source: &str) -> Result<Self, DbQueueError> {
        self.add_script(name, source)?;
        Ok(self)
    }

    #[must_use]
    pub fn with_shared_module(mut self, source: impl Into<String>) -> Self {
        self.shared_module = Some(source.into());
        self
    }

    /// Read every `<design>_<N>.rhai` under `dir`, where the design is the directory name.
    ///
    /// # Errors
    /// Returns a `Module`-stage error if the directory cannot be read, and propagates script
    /// read failures.
    pub fn from_directory(dir: &Path) -> Result<Self, DbQueueError> {
        let design = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                DbQueueError::migration(
                    MigrationStage::Module,
                    format!("'{}' does not name a migration design", dir.display()),
                )
            })?
            .to_string();
        let entries = fs::read_dir(dir).map_err(|e| {
            DbQueueError::migration(
                MigrationStage::Module,
                format!("cannot read migrations in '{}': {e}", dir.display()),
            )
        })?;

        let mut set = Self::new(design);
        for entry in entries {
            let path = entry
                .map_err(|e| DbQueueError::migration(MigrationStage::Module, e.to_string()))?
                .path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let read = |p: &Path| {
                fs::read_to_string(p).map_err(|e| {
                    DbQueueError::migration(
                        MigrationStage::File,
                        format!("cannot read '{}': {e}", p.display()),
                    )
                })
            };
            if name == SHARED_MODULE_FILE {
                set.shared_module = Some(read(&path)?);
            } else if matches!(parse_script_name(name), Some((d, _)) if d == set.design) {
                let source = read(&path)?;
                set.add_script(name.to_string(), source)?;
            }
        }
        Ok(set)
    }

    #[must_use]
    pub fn design(&self) -> &str {
        &self.design
    }

    /// Highest script number, or 0 for an empty set.
    #[must_use]
    pub fn latest_available(&self) -> i64 {
        self.files.keys().next_back().copied().unwrap_or(0)
    }

    #[must_use]
    pub fn file(&self, number: i64) -> Option<&MigrationFile> {
        self.files.get(&number)
    }

    pub fn numbers(&self) -> impl Iterator<Item = i64> + '_ {
        self.files.keys().copied()
    }

    #[must_use]
    pub fn shared_module(&self) -> Option<&str> {
        self.shared_module.as_deref()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }
}

/// In-memory migration sets, addressed as `PAYLOAD:<design>`.
#[derive(Debug, Clone, Default)]
pub struct MigrationSets {
    sets: Arc<RwLock<HashMap<String, Arc<MigrationSet>>>>,
}

impl MigrationSets {
    pub fn register(&self, set: MigrationSet) {
        let mut sets = self.sets.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        sets.insert(set.design.clone(), Arc::new(set));
    }

    #[must_use]
    pub fn get(&self, design: &str) -> Option<Arc<MigrationSet>> {
        let sets = self.sets.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        sets.get(design).cloned()
    }

    /// Resolve a `migrations` setting to its script set.
    ///
    /// # Errors
    /// Returns a `Module`-stage [`DbQueueError::MigrationError`] when the payload is not
    /// registered or the directory cannot be read.
    pub fn resolve(&self, spec: &str) -> Result<Arc<MigrationSet>, DbQueueError> {
        let spec = spec.trim();
        if let Some(design) = spec.strip_prefix(PAYLOAD_PREFIX) {
            return self.get(design).ok_or_else(|| {
                DbQueueError::migration(
                    MigrationStage::Module,
                    format!("no migration payload named '{design}'"),
                )
            });
        }
        MigrationSet::from_directory(Path::new(spec)).map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_names() {
        assert_eq!(parse_script_name("acuranzo_1000.rhai"), Some(("acuranzo", 1000)));
        assert_eq!(parse_script_name("my_app_7.rhai"), Some(("my_app", 7)));
        assert_eq!(parse_script_name("acuranzo_1234567.rhai"), None);
        assert_eq!(parse_script_name("acuranzo_12.lua"), None);
        assert_eq!(parse_script_name("database.rhai"), None);
    }

    #[test]
    fn orders_numerically() -> Result<(), DbQueueError> {
        let set = MigrationSet::new("app")
            .with_script("app_10.rhai", "")?
            .with_script("app_9.rhai", "")?
            .with_script("app_100.rhai", "")?;
        assert_eq!(set.numbers().collect::<Vec<_>>(), vec![9, 10, 100]);
        assert_eq!(set.latest_available(), 100);
        assert!(MigrationSet::new("app").with_script("other_1.rhai", "").is_err());
        assert!(set.clone().with_script("app_10.rhai", "").is_err());
        Ok(())
    }

    #[test]
    fn reads_directory() -> Result<(), Box<dyn std::error::Error>> {
        let root = tempfile::tempdir()?;
        let dir = root.path().join("shop");
        fs::create_dir(&dir)?;
        fs::write(dir.join("shop_1.rhai"), "fn run_migration(e, d, s) { \"SELECT 1\" }")?;
        fs::write(dir.join("shop_2.rhai"), "fn run_migration(e, d, s) { \"SELECT 2\" }")?;
        fs::write(dir.join(SHARED_MODULE_FILE), "fn quote(x) { x }")?;
        fs::write(dir.join("notes.txt"), "ignored")?;

        let sets = MigrationSets::default();
        let set = sets.resolve(dir.to_str().ok_or("path")?)?;
        assert_eq!(set.design(), "shop");
        assert_eq!(set.latest_available(), 2);
        assert!(set.shared_module().is_some());

        let missing = sets.resolve("PAYLOAD:nothing").expect_err("unregistered");
        assert_eq!(missing.migration_stage(), Some(MigrationStage::Module));
        sets.register(MigrationSet::new("nothing"));
        assert!(sets.resolve("PAYLOAD:nothing")?.is_empty());
        Ok(())
    }
}
