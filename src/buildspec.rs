use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// How the packaged application is laid out by the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleMode {
    #[default]
    Onefile,
    Onedir,
}

impl BundleMode {
    pub fn builder_flag(&self) -> &'static str {
        match self {
            BundleMode::Onefile => "--onefile",
            BundleMode::Onedir => "--onedir",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Macos,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Macos
        } else {
            Platform::Linux
        }
    }

    pub fn executable_suffix(&self) -> &'static str {
        match self {
            Platform::Windows => ".exe",
            Platform::Linux | Platform::Macos => "",
        }
    }

    /// Separator between source and destination in `--add-data`.
    pub fn data_separator(&self) -> char {
        match self {
            Platform::Windows => ';',
            Platform::Linux | Platform::Macos => ':',
        }
    }
}

/// A module the builder's import scanner cannot find on its own.
///
/// Construction checks the dotted-identifier syntax, so a recipe with a
/// malformed entry fails to load instead of reaching the builder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct HiddenImport(String);

impl HiddenImport {
    pub fn parse(value: &str) -> Result<Self, String> {
        let value = value.trim();
        if value.is_empty() {
            return Err("hidden import cannot be empty".to_string());
        }
        for segment in value.split('.') {
            if !is_identifier(segment) {
                return Err(format!(
                    "hidden import '{value}' is not a dotted module path ('{segment}' is not an identifier)"
                ));
            }
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Top-level package, e.g. `flet` for `flet.core.page`.
    pub fn root(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }
}

impl TryFrom<String> for HiddenImport {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<HiddenImport> for String {
    fn from(value: HiddenImport) -> Self {
        value.0
    }
}

impl fmt::Display for HiddenImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AssetMapping {
    pub source: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildSpec {
    pub name: String,
    pub entry_point: PathBuf,
    #[serde(default)]
    pub mode: BundleMode,
    #[serde(default = "default_console")]
    pub console: bool,
    #[serde(default)]
    pub assets: Vec<AssetMapping>,
    #[serde(default)]
    pub hidden_imports: Vec<HiddenImport>,
    /// Additional top-level packages hidden imports may come from, for
    /// distributions whose import name differs from the requirement name.
    #[serde(default)]
    pub import_roots: Vec<String>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_builder")]
    pub builder: String,
    #[serde(default)]
    pub platform: Option<Platform>,
}

fn default_console() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("dist")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("build")
}

fn default_builder() -> String {
    "PyInstaller".to_string()
}

impl BuildSpec {
    pub fn new(name: impl Into<String>, entry_point: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            entry_point: entry_point.into(),
            mode: BundleMode::default(),
            console: default_console(),
            assets: Vec::new(),
            hidden_imports: Vec::new(),
            import_roots: Vec::new(),
            output_dir: default_output_dir(),
            work_dir: default_work_dir(),
            builder: default_builder(),
            platform: None,
        }
    }

    pub fn target_platform(&self) -> Platform {
        self.platform.unwrap_or_else(Platform::current)
    }

    /// Where the published file lands, relative to the workspace:
    /// `<output_dir>/<name><suffix>` for single-file builds,
    /// `<output_dir>/<name>.zip` for directory builds.
    pub fn artifact_path(&self) -> PathBuf {
        match self.mode {
            BundleMode::Onefile => self.output_dir.join(format!(
                "{}{}",
                self.name,
                self.target_platform().executable_suffix()
            )),
            BundleMode::Onedir => self.output_dir.join(format!("{}.zip", self.name)),
        }
    }

    /// Directory the builder writes in `onedir` mode.
    pub fn bundle_dir(&self) -> PathBuf {
        self.output_dir.join(&self.name)
    }

    /// Hidden imports whose top-level package is neither provided by one of
    /// `provided_roots` nor listed in `import_roots`.
    pub fn unknown_hidden_imports(&self, provided_roots: &[String]) -> Vec<&HiddenImport> {
        self.hidden_imports
            .iter()
            .filter(|import| {
                let root = import.root();
                !provided_roots
                    .iter()
                    .chain(self.import_roots.iter())
                    .any(|known| known.eq_ignore_ascii_case(root))
            })
            .collect()
    }

    /// `--add-data` value for one mapping, with the source made absolute
    /// because the builder resolves relative sources against its spec path.
    pub fn add_data_arg(&self, mapping: &AssetMapping, workspace: &Path) -> String {
        let source = if mapping.source.is_absolute() {
            mapping.source.clone()
        } else {
            workspace.join(&mapping.source)
        };
        format!(
            "{}{}{}",
            source.display(),
            self.target_platform().data_separator(),
            mapping.target.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_path_uses_name_and_platform_suffix() {
        let spec = BuildSpec::new("SRTTranslator", "main.py");
        let expected = PathBuf::from(format!(
            "dist/SRTTranslator{}",
            Platform::current().executable_suffix()
        ));
        assert_eq!(spec.artifact_path(), expected);

        let mut windows = spec.clone();
        windows.platform = Some(Platform::Windows);
        assert_eq!(windows.artifact_path(), PathBuf::from("dist/SRTTranslator.exe"));

        let mut onedir = spec;
        onedir.mode = BundleMode::Onedir;
        assert_eq!(onedir.artifact_path(), PathBuf::from("dist/SRTTranslator.zip"));
        assert_eq!(onedir.bundle_dir(), PathBuf::from("dist/SRTTranslator"));
    }

    #[test]
    fn hidden_imports_reject_bad_syntax() {
        assert!(HiddenImport::parse("flet.core.page").is_ok());
        assert!(HiddenImport::parse("_private").is_ok());
        assert!(HiddenImport::parse("").is_err());
        assert!(HiddenImport::parse("flet..core").is_err());
        assert!(HiddenImport::parse("3d").is_err());
        assert!(HiddenImport::parse("flet-core").is_err());
    }

    #[test]
    fn hidden_imports_deserialize_through_validation() {
        let ok: Vec<HiddenImport> = serde_yaml::from_str("[flet, pysrt.srtfile]").unwrap();
        assert_eq!(ok[1].root(), "pysrt");
        let err = serde_yaml::from_str::<Vec<HiddenImport>>("[flet, 'py srt']").unwrap_err();
        assert!(err.to_string().contains("not an identifier"));
    }

    #[test]
    fn unknown_roots_are_reported() {
        let mut spec = BuildSpec::new("app", "main.py");
        spec.hidden_imports = ["flet.core", "flte", "pysrt", "flet_runtime"]
            .iter()
            .map(|m| HiddenImport::parse(m).unwrap())
            .collect();
        spec.import_roots = vec!["flet_runtime".into()];
        let provided = vec!["flet".to_string(), "pysrt".to_string()];
        let unknown: Vec<_> = spec
            .unknown_hidden_imports(&provided)
            .into_iter()
            .map(HiddenImport::as_str)
            .collect();
        assert_eq!(unknown, vec!["flte"]);
    }

    #[cfg(unix)]
    #[test]
    fn add_data_uses_platform_separator() {
        let mut spec = BuildSpec::new("app", "main.py");
        let mapping = AssetMapping {
            source: PathBuf::from("assets"),
            target: PathBuf::from("assets"),
        };
        spec.platform = Some(Platform::Linux);
        assert_eq!(
            spec.add_data_arg(&mapping, Path::new("/work")),
            "/work/assets:assets"
        );
        spec.platform = Some(Platform::Windows);
        assert!(spec.add_data_arg(&mapping, Path::new("/work")).ends_with(";assets"));
    }
}
