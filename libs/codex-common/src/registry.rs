// Language runtime registry
// Loads and validates runtime profiles from languages.json

use crate::error::RegistryError;
use crate::types::{Language, ResourceLimits, MIN_MEMORY_MB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Mount point of the job root inside every sandbox box.
pub const BOX_MOUNT: &str = "/box";

fn default_compile_timeout() -> u64 {
    10_000
}

fn default_cpu_limit() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileStep {
    /// Command template; `{source}` and `{artifact}` expand to paths inside the box.
    pub command: Vec<String>,
    pub artifact: String,
    #[serde(default = "default_compile_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeProfile {
    pub language: Language,
    pub version: String,
    pub image: String,
    pub source_file: String,
    pub compile: Option<CompileStep>,
    pub run: Vec<String>,
    pub limits: ResourceLimits,
    /// Fraction of a CPU the box may use.
    pub cpu_limit: f64,
}

impl RuntimeProfile {
    pub fn file_extension(&self) -> &str {
        self.source_file.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
    }

    pub fn source_path(&self) -> String {
        format!("{}/{}", BOX_MOUNT, self.source_file)
    }

    pub fn artifact_path(&self) -> Option<String> {
        self.compile
            .as_ref()
            .map(|step| format!("{}/{}", BOX_MOUNT, step.artifact))
    }

    pub fn compile_command(&self) -> Option<Vec<String>> {
        self.compile.as_ref().map(|step| self.expand(&step.command))
    }

    pub fn run_command(&self) -> Vec<String> {
        self.expand(&self.run)
    }

    fn expand(&self, template: &[String]) -> Vec<String> {
        let source = self.source_path();
        let artifact = self.artifact_path().unwrap_or_else(|| source.clone());
        template
            .iter()
            .map(|arg| arg.replace("{source}", &source).replace("{artifact}", &artifact))
            .collect()
    }
}

/// One entry of languages.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LanguageEntry {
    name: String,
    #[serde(default)]
    version: String,
    image: String,
    source_file: String,
    #[serde(default)]
    compile: Option<CompileStep>,
    run: Vec<String>,
    #[serde(default)]
    limits: Option<ResourceLimits>,
    #[serde(default = "default_cpu_limit")]
    cpu_limit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LanguagesFile {
    languages: Vec<LanguageEntry>,
}

/// Registry of runtime profiles.
///
/// Built once at startup and never mutated afterwards, so it is shared behind an
/// `Arc` and read without locking.
#[derive(Debug, Clone)]
pub struct RuntimeRegistry {
    profiles: HashMap<Language, RuntimeProfile>,
}

impl RuntimeRegistry {
    /// Load runtime profiles from languages.json
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, RegistryError> {
        let file: LanguagesFile = serde_json::from_str(content)?;
        let mut profiles = HashMap::new();

        for entry in file.languages {
            let profile = validate(entry)?;
            let language = profile.language;
            if profiles.insert(language, profile).is_some() {
                return Err(RegistryError::InvalidProfile {
                    language: language.to_string(),
                    message: "configured more than once".to_string(),
                });
            }
        }

        if profiles.is_empty() {
            return Err(RegistryError::InvalidProfile {
                language: String::new(),
                message: "no languages configured".to_string(),
            });
        }

        Ok(Self { profiles })
    }

    /// Profiles for the three languages the IDE offers, used when no config file is present.
    pub fn builtin() -> Self {
        let limits = ResourceLimits::default();
        let profiles = [
            RuntimeProfile {
                language: Language::Python,
                version: "3.12".to_string(),
                image: "python:3.12-slim".to_string(),
                source_file: "main.py".to_string(),
                compile: None,
                run: vec!["python3".into(), "-u".into(), "{source}".into()],
                limits,
                cpu_limit: default_cpu_limit(),
            },
            RuntimeProfile {
                language: Language::Cpp,
                version: "13".to_string(),
                image: "gcc:13".to_string(),
                source_file: "main.cpp".to_string(),
                compile: Some(CompileStep {
                    command: vec![
                        "g++".into(),
                        "-O2".into(),
                        "-std=c++17".into(),
                        "-o".into(),
                        "{artifact}".into(),
                        "{source}".into(),
                    ],
                    artifact: "main".to_string(),
                    timeout_ms: default_compile_timeout(),
                }),
                run: vec!["{artifact}".into()],
                limits,
                cpu_limit: default_cpu_limit(),
            },
            RuntimeProfile {
                language: Language::JavaScript,
                version: "20".to_string(),
                image: "node:20-slim".to_string(),
                source_file: "main.js".to_string(),
                compile: None,
                run: vec!["node".into(), "{source}".into()],
                limits,
                cpu_limit: default_cpu_limit(),
            },
        ];

        Self {
            profiles: profiles.into_iter().map(|p| (p.language, p)).collect(),
        }
    }

    pub fn profile_for(&self, language: Language) -> Result<&RuntimeProfile, RegistryError> {
        self.profiles
            .get(&language)
            .ok_or_else(|| RegistryError::UnsupportedLanguage(language.to_string()))
    }

    /// Enabled languages in a stable order.
    pub fn languages(&self) -> Vec<Language> {
        Language::ALL
            .into_iter()
            .filter(|lang| self.profiles.contains_key(lang))
            .collect()
    }

    pub fn profiles(&self) -> Vec<&RuntimeProfile> {
        self.languages()
            .into_iter()
            .filter_map(|lang| self.profiles.get(&lang))
            .collect()
    }
}

fn validate(entry: LanguageEntry) -> Result<RuntimeProfile, RegistryError> {
    let language: Language = entry.name.parse()?;
    let invalid = |message: &str| RegistryError::InvalidProfile {
        language: entry.name.clone(),
        message: message.to_string(),
    };

    if !is_plain_file_name(&entry.source_file) {
        return Err(invalid("source_file must be a plain file name"));
    }
    if entry.run.is_empty() {
        return Err(invalid("run command is empty"));
    }
    if entry.image.trim().is_empty() {
        return Err(invalid("image is empty"));
    }
    if let Some(step) = &entry.compile {
        if step.command.is_empty() {
            return Err(invalid("compile command is empty"));
        }
        if !is_plain_file_name(&step.artifact) {
            return Err(invalid("compile artifact must be a plain file name"));
        }
        if step.timeout_ms == 0 {
            return Err(invalid("compile timeout must be positive"));
        }
    }

    let limits = entry.limits.unwrap_or_default();
    if limits.wall_time_ms == 0
        || limits.cpu_time_ms == 0
        || limits.memory_mb == 0
        || limits.output_cap_bytes == 0
        || limits.max_processes == 0
    {
        return Err(invalid("limits must be positive"));
    }
    if limits.memory_mb < MIN_MEMORY_MB {
        return Err(invalid(&format!("memory_mb must be at least {}", MIN_MEMORY_MB)));
    }
    if entry.cpu_limit.is_nan() || entry.cpu_limit <= 0.0 {
        return Err(invalid("cpu_limit must be positive"));
    }

    Ok(RuntimeProfile {
        language,
        version: entry.version,
        image: entry.image,
        source_file: entry.source_file,
        compile: entry.compile,
        run: entry.run,
        limits,
        cpu_limit: entry.cpu_limit,
    })
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains('/') && !name.contains('\\')
}
