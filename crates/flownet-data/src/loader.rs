//! Resolution pipeline: reads data files, resolves cross-references, builds
//! engine definitions.
//!
//! [`DataFile`] names the files a data directory holds and reads them in
//! whichever of RON, TOML or JSON they are written. [`load_flow_data`] reads
//! a whole directory and [`FlowData::install`] hands the result to an engine.

use crate::schema::{AmountData, ChainData, ConversionRateData, RecipeData};
use flownet_core::chain::ConversionChain;
use flownet_core::config::EngineConfig;
use flownet_core::engine::{EngineError, FlowEngine};
use flownet_core::fixed::{Fixed64, f64_to_fixed64};
use flownet_core::id::{RecipeId, ResourceType};
use flownet_core::recipe::{ConversionRecipe, conversion_rate_recipe_id};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// ===========================================================================
// Errors
// ===========================================================================

/// Errors that can occur during data loading.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    /// A required data file was not found in the given directory.
    #[error("required file '{file}' not found in {dir}")]
    MissingRequired { file: String, dir: PathBuf },

    /// The file has an extension we don't support.
    #[error("unsupported format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    /// Two files with the same base name but different formats exist.
    #[error("conflicting formats: {a} and {b}")]
    ConflictingFormats { a: PathBuf, b: PathBuf },

    /// A deserialization error occurred.
    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    /// A value parsed but is out of range.
    #[error("invalid value in {file}: {detail}")]
    Invalid { file: PathBuf, detail: String },

    /// A name reference could not be resolved.
    #[error("unresolved {expected_kind} reference '{name}' in {file}")]
    UnresolvedRef {
        file: PathBuf,
        name: String,
        expected_kind: &'static str,
    },

    /// A duplicate name was found.
    #[error("duplicate name '{name}' in {file}")]
    DuplicateName { file: PathBuf, name: String },

    /// The engine rejected a loaded definition.
    #[error("engine rejected data: {0}")]
    Engine(#[from] EngineError),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Data files
// ===========================================================================

/// Serialization formats a data file may use, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

impl Format {
    /// Probe order when looking for a data file.
    const ALL: [Format; 3] = [Format::Ron, Format::Toml, Format::Json];

    pub fn extension(self) -> &'static str {
        match self {
            Format::Ron => "ron",
            Format::Toml => "toml",
            Format::Json => "json",
        }
    }

    /// The format named by `path`'s extension.
    pub fn of(path: &Path) -> Result<Format, DataLoadError> {
        let ext = path.extension().and_then(|e| e.to_str());
        Format::ALL
            .into_iter()
            .find(|f| Some(f.extension()) == ext)
            .ok_or_else(|| DataLoadError::UnsupportedFormat {
                file: path.to_path_buf(),
            })
    }

    fn parse<T: DeserializeOwned>(self, path: &Path, text: &str) -> Result<T, DataLoadError> {
        let parsed = match self {
            Format::Ron => ron::from_str(text).map_err(|e| e.to_string()),
            Format::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
            Format::Toml => toml::from_str(text).map_err(|e| e.to_string()),
        };
        parsed.map_err(|detail| DataLoadError::Parse {
            file: path.to_path_buf(),
            detail,
        })
    }
}

/// The files a flow data directory may hold. Each lives under its base name
/// with one of the [`Format`] extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFile {
    Config,
    Recipes,
    ConversionRates,
    Chains,
}

impl DataFile {
    /// File stem, also the table key that wraps a list in TOML.
    pub fn base_name(self) -> &'static str {
        match self {
            DataFile::Config => "config",
            DataFile::Recipes => "recipes",
            DataFile::ConversionRates => "conversion_rates",
            DataFile::Chains => "chains",
        }
    }

    /// Find this file in `dir`. The same file in two formats is ambiguous
    /// and reported as `ConflictingFormats`.
    pub fn locate(self, dir: &Path) -> Result<Option<PathBuf>, DataLoadError> {
        let mut present = Format::ALL
            .into_iter()
            .map(|f| dir.join(format!("{}.{}", self.base_name(), f.extension())))
            .filter(|p| p.is_file());
        let found = present.next();
        if let (Some(a), Some(b)) = (&found, present.next()) {
            return Err(DataLoadError::ConflictingFormats { a: a.clone(), b });
        }
        Ok(found)
    }

    /// [`DataFile::locate`] for a file the directory must contain.
    pub fn expect_in(self, dir: &Path) -> Result<PathBuf, DataLoadError> {
        self.locate(dir)?.ok_or_else(|| DataLoadError::MissingRequired {
            file: self.base_name().to_string(),
            dir: dir.to_path_buf(),
        })
    }

    /// Read a single value from `path`.
    pub fn read<T: DeserializeOwned>(path: &Path) -> Result<T, DataLoadError> {
        let format = Format::of(path)?;
        let text = std::fs::read_to_string(path)?;
        format.parse(path, &text)
    }

    /// Read a list of definitions from `path`. TOML has no top-level arrays,
    /// so there the list sits under this file's base name.
    pub fn read_list<T: DeserializeOwned>(self, path: &Path) -> Result<Vec<T>, DataLoadError> {
        let format = Format::of(path)?;
        let text = std::fs::read_to_string(path)?;
        if format != Format::Toml {
            return format.parse(path, &text);
        }

        let key = self.base_name();
        let mut table: toml::Table = format.parse(path, &text)?;
        let list = table.remove(key).ok_or_else(|| DataLoadError::Parse {
            file: path.to_path_buf(),
            detail: format!("missing [[{key}]] entries"),
        })?;
        list.try_into().map_err(|e: toml::de::Error| DataLoadError::Parse {
            file: path.to_path_buf(),
            detail: e.to_string(),
        })
    }
}

// ===========================================================================
// Resolution
// ===========================================================================

/// Largest amount accepted from a data file.
const MAX_AMOUNT: f64 = i32::MAX as f64;

fn positive_amount(file: &Path, what: &str, value: f64) -> Result<Fixed64, DataLoadError> {
    if !value.is_finite() || value <= 0.0 || value > MAX_AMOUNT {
        return Err(DataLoadError::Invalid {
            file: file.to_path_buf(),
            detail: format!("{what} must be positive and finite, got {value}"),
        });
    }
    Ok(f64_to_fixed64(value))
}

fn resolve_recipe(file: &Path, data: &RecipeData) -> Result<ConversionRecipe, DataLoadError> {
    let entry = |e: &AmountData| -> Result<(ResourceType, Fixed64), DataLoadError> {
        let what = format!("{} amount of {}", data.name, e.resource());
        Ok((ResourceType::from(e.resource()), positive_amount(file, &what, e.amount())?))
    };

    let mut recipe = ConversionRecipe::new(data.name.as_str(), data.duration);
    for input in &data.inputs {
        let (resource, amount) = entry(input)?;
        recipe = recipe.input(resource, amount);
    }
    for output in &data.outputs {
        let (resource, amount) = entry(output)?;
        recipe = recipe.output(resource, amount);
    }
    if let Some(efficiency) = data.base_efficiency {
        let what = format!("{} base efficiency", data.name);
        recipe = recipe.with_base_efficiency(positive_amount(file, &what, efficiency)?);
    }
    if let Some(tech) = &data.technology {
        recipe = recipe.requiring(tech.as_str());
    }
    Ok(recipe)
}

/// A conversion rate after resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRate {
    pub source: ResourceType,
    pub target: ResourceType,
    pub rate: Fixed64,
}

/// Everything a data directory defines, resolved into engine types.
#[derive(Debug, Clone, Default)]
pub struct FlowData {
    pub config: Option<EngineConfig>,
    pub recipes: Vec<ConversionRecipe>,
    pub conversion_rates: Vec<ConversionRate>,
    pub chains: Vec<ConversionChain>,
}

/// Load every definition from `dir`.
///
/// Files (each `.ron`, `.toml` or `.json`): `recipes` (required), and the
/// optional `config`, `conversion_rates` and `chains`. Recipe names must be
/// unique; chain steps must name a recipe or a conversion rate
/// (`convert:{source}->{target}`).
pub fn load_flow_data(dir: &Path) -> Result<FlowData, DataLoadError> {
    let config = match DataFile::Config.locate(dir)? {
        Some(path) => {
            let config: EngineConfig = DataFile::read(&path)?;
            config.validate().map_err(|e| DataLoadError::Invalid {
                file: path.clone(),
                detail: e.to_string(),
            })?;
            Some(config)
        }
        None => None,
    };

    let recipes_path = DataFile::Recipes.expect_in(dir)?;
    let recipe_data: Vec<RecipeData> = DataFile::Recipes.read_list(&recipes_path)?;
    let mut names: HashSet<String> = HashSet::new();
    let mut recipes = Vec::with_capacity(recipe_data.len());
    for data in &recipe_data {
        if !names.insert(data.name.clone()) {
            return Err(DataLoadError::DuplicateName {
                file: recipes_path.clone(),
                name: data.name.clone(),
            });
        }
        recipes.push(resolve_recipe(&recipes_path, data)?);
    }

    let mut conversion_rates = Vec::new();
    if let Some(path) = DataFile::ConversionRates.locate(dir)? {
        let rate_data: Vec<ConversionRateData> = DataFile::ConversionRates.read_list(&path)?;
        for data in rate_data {
            let what = format!("rate {} -> {}", data.source, data.target);
            let rate = ConversionRate {
                source: ResourceType::from(data.source),
                target: ResourceType::from(data.target),
                rate: positive_amount(&path, &what, data.rate)?,
            };
            names.insert(conversion_rate_recipe_id(&rate.source, &rate.target).to_string());
            conversion_rates.push(rate);
        }
    }

    let mut chains = Vec::new();
    if let Some(path) = DataFile::Chains.locate(dir)? {
        let chain_data: Vec<ChainData> = DataFile::Chains.read_list(&path)?;
        let mut chain_names = HashSet::new();
        for data in chain_data {
            if !chain_names.insert(data.name.clone()) {
                return Err(DataLoadError::DuplicateName {
                    file: path.clone(),
                    name: data.name,
                });
            }
            if let Some(missing) = data.steps.iter().find(|s| !names.contains(s.as_str())) {
                return Err(DataLoadError::UnresolvedRef {
                    file: path.clone(),
                    name: missing.clone(),
                    expected_kind: "recipe",
                });
            }
            chains.push(ConversionChain::new(
                data.name.as_str(),
                data.steps.into_iter().map(RecipeId::from),
            ));
        }
    }

    info!(
        dir = %dir.display(),
        recipes = recipes.len(),
        conversion_rates = conversion_rates.len(),
        chains = chains.len(),
        "flow data loaded"
    );
    Ok(FlowData {
        config,
        recipes,
        conversion_rates,
        chains,
    })
}

impl FlowData {
    /// Install into an existing engine: configuration first, then recipes,
    /// conversion rates and chains. Stops at the first rejection.
    pub fn install(self, engine: &mut FlowEngine) -> Result<(), DataLoadError> {
        if let Some(config) = self.config {
            engine.set_config(config).map_err(EngineError::from)?;
        }
        for recipe in self.recipes {
            engine.register_recipe(recipe).map_err(EngineError::from)?;
        }
        for rate in self.conversion_rates {
            let id = engine
                .set_conversion_rate(&rate.source, &rate.target, rate.rate)
                .map_err(EngineError::from)?;
            debug!(recipe = %id, "conversion rate installed");
        }
        for chain in self.chains {
            engine.register_chain(chain).map_err(EngineError::from)?;
        }
        Ok(())
    }

    /// Build a fresh engine from the loaded configuration (or defaults) and
    /// install the definitions.
    pub fn into_engine(mut self) -> Result<FlowEngine, DataLoadError> {
        let config = self.config.take().unwrap_or_default();
        let mut engine = FlowEngine::new(config).map_err(EngineError::from)?;
        self.install(&mut engine)?;
        Ok(engine)
    }
}

/// Load `dir` and install it into `engine`.
pub fn load_into(engine: &mut FlowEngine, dir: &Path) -> Result<(), DataLoadError> {
    load_flow_data(dir)?.install(engine)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Create a temporary directory with a unique name for test isolation.
    fn make_test_dir(suffix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("flownet_data_test_{suffix}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn cleanup(dir: &Path) {
        let _ = fs::remove_dir_all(dir);
    }

    const RECIPES_RON: &str = r#"[
        (name: "smelt", inputs: [("ore", 2.0)], outputs: [("metal", 1.0)], duration: 1000),
        (name: "forge", inputs: [(resource: "metal", amount: 3.0)], outputs: [("alloy", 1.0)],
         duration: 2000, base_efficiency: Some(1.5), technology: Some("metallurgy")),
    ]"#;

    // -----------------------------------------------------------------------
    // Data files
    // -----------------------------------------------------------------------

    #[test]
    fn format_follows_extension() {
        assert_eq!(Format::of(Path::new("recipes.ron")).unwrap(), Format::Ron);
        assert_eq!(Format::of(Path::new("chains.toml")).unwrap(), Format::Toml);
        assert_eq!(Format::of(Path::new("config.json")).unwrap(), Format::Json);
        for bad in ["recipes.yaml", "recipes"] {
            assert!(matches!(
                Format::of(Path::new(bad)),
                Err(DataLoadError::UnsupportedFormat { .. })
            ));
        }
    }

    #[test]
    fn same_file_in_two_formats_is_ambiguous() {
        let dir = make_test_dir("conflict");
        fs::write(dir.join("chains.ron"), "[]").unwrap();
        fs::write(dir.join("chains.json"), "[]").unwrap();

        assert!(matches!(
            DataFile::Chains.locate(&dir),
            Err(DataLoadError::ConflictingFormats { .. })
        ));
        assert_eq!(DataFile::ConversionRates.locate(&dir).unwrap(), None);
        cleanup(&dir);
    }

    #[test]
    fn absent_required_file_is_reported() {
        let dir = make_test_dir("require_missing");
        match DataFile::Recipes.expect_in(&dir) {
            Err(DataLoadError::MissingRequired { file, .. }) => assert_eq!(file, "recipes"),
            other => panic!("expected missing recipes, got {other:?}"),
        }
        cleanup(&dir);
    }

    #[test]
    fn recipes_read_from_ron() {
        let dir = make_test_dir("deser_ron");
        let path = dir.join("recipes.ron");
        fs::write(&path, RECIPES_RON).unwrap();

        let recipes: Vec<RecipeData> = DataFile::Recipes.read_list(&path).unwrap();
        assert_eq!(recipes.len(), 2);
        assert_eq!(recipes[1].inputs[0].resource(), "metal");
        assert_eq!(recipes[1].technology.as_deref(), Some("metallurgy"));
        cleanup(&dir);
    }

    #[test]
    fn toml_lists_sit_under_the_base_name() {
        let dir = make_test_dir("deser_toml");
        let path = dir.join("recipes.toml");
        fs::write(
            &path,
            r#"
[[recipes]]
name = "smelt"
inputs = [["ore", 2.0]]
outputs = [{ resource = "metal", amount = 1.0 }]
duration = 1000
"#,
        )
        .unwrap();

        let list: Vec<RecipeData> = DataFile::Recipes.read_list(&path).unwrap();
        assert_eq!(list[0].inputs[0].resource(), "ore");
        assert_eq!(list[0].outputs[0].amount(), 1.0);
        // Read under the wrong key, the entries are not found.
        assert!(matches!(
            DataFile::Chains.read_list::<ChainData>(&path),
            Err(DataLoadError::Parse { .. })
        ));
        cleanup(&dir);
    }

    #[test]
    fn parse_error_names_the_file() {
        let dir = make_test_dir("parse_err");
        let path = dir.join("recipes.json");
        fs::write(&path, "{ not json").unwrap();

        let err = DataFile::Recipes.read_list::<RecipeData>(&path).unwrap_err();
        assert!(err.to_string().contains("recipes.json"));
        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // load_flow_data
    // -----------------------------------------------------------------------

    #[test]
    fn load_resolves_recipes_and_chains() {
        let dir = make_test_dir("load_ok");
        fs::write(dir.join("recipes.ron"), RECIPES_RON).unwrap();
        fs::write(
            dir.join("conversion_rates.json"),
            r#"[{ "source": "scrap", "target": "metal", "rate": 0.5 }]"#,
        )
        .unwrap();
        fs::write(
            dir.join("chains.json"),
            r#"[{ "name": "alloy-line", "steps": ["smelt", "convert:scrap->metal", "forge"] }]"#,
        )
        .unwrap();

        let data = load_flow_data(&dir).unwrap();
        assert!(data.config.is_none());
        assert_eq!(data.recipes.len(), 2);
        assert_eq!(data.recipes[1].base_efficiency, f64_to_fixed64(1.5));
        assert_eq!(data.conversion_rates[0].rate, f64_to_fixed64(0.5));
        assert_eq!(data.chains[0].steps.len(), 3);
        cleanup(&dir);
    }

    #[test]
    fn duplicate_recipe_name_is_rejected() {
        let dir = make_test_dir("dup");
        fs::write(
            dir.join("recipes.json"),
            r#"[
                { "name": "smelt", "outputs": [["metal", 1.0]], "duration": 10 },
                { "name": "smelt", "outputs": [["metal", 2.0]], "duration": 10 }
            ]"#,
        )
        .unwrap();

        assert!(matches!(
            load_flow_data(&dir),
            Err(DataLoadError::DuplicateName { .. })
        ));
        cleanup(&dir);
    }

    #[test]
    fn chain_step_must_name_a_recipe() {
        let dir = make_test_dir("unresolved");
        fs::write(dir.join("recipes.ron"), RECIPES_RON).unwrap();
        fs::write(dir.join("chains.ron"), r#"[(name: "bad", steps: ["smelt", "weld"])]"#).unwrap();

        match load_flow_data(&dir) {
            Err(DataLoadError::UnresolvedRef { name, .. }) => assert_eq!(name, "weld"),
            other => panic!("expected unresolved ref, got {other:?}"),
        }
        cleanup(&dir);
    }

    #[test]
    fn negative_amount_is_invalid() {
        let dir = make_test_dir("negative");
        fs::write(
            dir.join("recipes.ron"),
            r#"[(name: "smelt", outputs: [("metal", -1.0)], duration: 10)]"#,
        )
        .unwrap();

        assert!(matches!(load_flow_data(&dir), Err(DataLoadError::Invalid { .. })));
        cleanup(&dir);
    }

    #[test]
    fn invalid_config_file_is_rejected() {
        let dir = make_test_dir("bad_config");
        fs::write(dir.join("recipes.ron"), "[]").unwrap();
        fs::write(dir.join("config.toml"), "processing_interval = 0\n").unwrap();

        assert!(matches!(load_flow_data(&dir), Err(DataLoadError::Invalid { .. })));
        cleanup(&dir);
    }

    #[test]
    fn into_engine_applies_config_and_definitions() {
        let dir = make_test_dir("into_engine");
        fs::write(dir.join("recipes.ron"), RECIPES_RON).unwrap();
        fs::write(dir.join("config.toml"), "batch_size = 12\nquality_variance = 0.0\n").unwrap();

        let engine = load_flow_data(&dir).unwrap().into_engine().unwrap();
        assert_eq!(engine.config().batch_size, 12);
        assert_eq!(engine.config().processing_interval, 1000);
        assert_eq!(engine.all_conversion_recipes().len(), 2);
        cleanup(&dir);
    }

    #[test]
    fn install_reports_engine_rejection() {
        let dir = make_test_dir("reject");
        fs::write(
            dir.join("recipes.ron"),
            r#"[(name: "instant", outputs: [("metal", 1.0)], duration: 0)]"#,
        )
        .unwrap();

        let mut engine = FlowEngine::default();
        assert!(matches!(
            load_into(&mut engine, &dir),
            Err(DataLoadError::Engine(EngineError::Recipe(_)))
        ));
        cleanup(&dir);
    }
}
