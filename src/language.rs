use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Placeholder replaced by the source file name in command templates
pub const SOURCE_PLACEHOLDER: &str = "%SOURCE%";
/// Placeholder replaced by the executable name in command templates
pub const EXE_PLACEHOLDER: &str = "%EXE%";

const EXECUTABLE_NAME: &str = "main";

/// Languages a submission may be written in
///
/// The set is closed: supporting another language means adding a variant and
/// its default toolchain below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
    Java,
    Python,
    JavaScript,
    Rust,
    Bash,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Language::C,
        Language::Cpp,
        Language::Java,
        Language::Python,
        Language::JavaScript,
        Language::Rust,
        Language::Bash,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Rust => "rust",
            Language::Bash => "bash",
        }
    }

    /// Built-in compile/run invocation for this language
    ///
    /// Interpreted languages get a syntax check as their compile step so that
    /// a broken source fails once for the whole submission.
    pub fn default_toolchain(self) -> Toolchain {
        let (source_file, compile, run): (&str, &[&str], &[&str]) = match self {
            Language::C => (
                "main.c",
                &["gcc", "-O2", "-std=c17", "-o", "%EXE%", "%SOURCE%", "-lm"],
                &["./%EXE%"],
            ),
            Language::Cpp => (
                "main.cpp",
                &["g++", "-O2", "-std=c++17", "-o", "%EXE%", "%SOURCE%"],
                &["./%EXE%"],
            ),
            Language::Java => (
                "Main.java",
                &["javac", "-encoding", "UTF-8", "%SOURCE%"],
                &["java", "-Xss64m", "-cp", ".", "Main"],
            ),
            Language::Python => (
                "main.py",
                &["python3", "-m", "py_compile", "%SOURCE%"],
                &["python3", "%SOURCE%"],
            ),
            Language::JavaScript => (
                "main.js",
                &["node", "--check", "%SOURCE%"],
                &["node", "%SOURCE%"],
            ),
            Language::Rust => (
                "main.rs",
                &["rustc", "-O", "--edition", "2021", "-o", "%EXE%", "%SOURCE%"],
                &["./%EXE%"],
            ),
            Language::Bash => (
                "main.sh",
                &["bash", "-n", "%SOURCE%"],
                &["bash", "%SOURCE%"],
            ),
        };

        Toolchain {
            language: self,
            source_file: source_file.to_string(),
            compile: Some(to_owned_args(compile)),
            run: to_owned_args(run),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let language = match s.trim().to_ascii_lowercase().as_str() {
            "c" => Language::C,
            "cpp" | "c++" | "cxx" => Language::Cpp,
            "java" => Language::Java,
            "python" | "python3" | "py" => Language::Python,
            "javascript" | "js" | "node" => Language::JavaScript,
            "rust" | "rs" => Language::Rust,
            "bash" | "sh" => Language::Bash,
            _ => return Err(UnknownLanguage(s.to_string())),
        };
        Ok(language)
    }
}

/// Per-language overrides read from the configuration file
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct LanguageOverride {
    pub source_file: Option<String>,
    pub compile: Option<Vec<String>>,
    pub run: Option<Vec<String>>,
}

/// How one language is compiled and run inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub language: Language,
    pub source_file: String,
    /// `None` skips the compile step entirely
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
}

impl Toolchain {
    pub fn compile_command(&self) -> Option<Vec<String>> {
        self.compile.as_ref().map(|cmd| self.apply_template(cmd))
    }

    pub fn run_command(&self) -> Vec<String> {
        self.apply_template(&self.run)
    }

    fn apply_template(&self, template: &[String]) -> Vec<String> {
        let mut mapping = HashMap::<&str, &str>::new();
        mapping.insert(SOURCE_PLACEHOLDER, &self.source_file);
        mapping.insert(EXE_PLACEHOLDER, EXECUTABLE_NAME);
        apply_template(template, &mapping)
    }
}

/// Language backend registry: every supported language mapped to its toolchain
#[derive(Debug, Clone)]
pub struct Toolchains {
    map: HashMap<Language, Toolchain>,
}

impl Toolchains {
    pub fn new(overrides: &HashMap<Language, LanguageOverride>) -> Self {
        let map = Language::ALL
            .into_iter()
            .map(|language| {
                let mut toolchain = language.default_toolchain();
                if let Some(o) = overrides.get(&language) {
                    if let Some(source_file) = &o.source_file {
                        toolchain.source_file = source_file.clone();
                    }
                    if let Some(compile) = &o.compile {
                        // An empty compile template disables the compile step
                        toolchain.compile = (!compile.is_empty()).then(|| compile.clone());
                    }
                    if let Some(run) = &o.run {
                        toolchain.run = run.clone();
                    }
                }
                (language, toolchain)
            })
            .collect();

        Self { map }
    }

    pub fn get(&self, language: Language) -> Option<&Toolchain> {
        self.map.get(&language)
    }

    pub fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<_> = self.map.keys().copied().collect();
        languages.sort();
        languages
    }
}

impl Default for Toolchains {
    fn default() -> Self {
        Self::new(&HashMap::new())
    }
}

/// Applies template substitutions to every argument of a command template
fn apply_template(cmd_template: &[String], mapping: &HashMap<&str, &str>) -> Vec<String> {
    cmd_template
        .iter()
        .map(|s| {
            let mut t = s.clone();
            for (k, v) in mapping.iter() {
                t = t.replace(k, v);
            }
            t
        })
        .collect()
}

fn to_owned_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_language_aliases() {
        assert_eq!("C++".parse::<Language>(), Ok(Language::Cpp));
        assert_eq!("python3".parse::<Language>(), Ok(Language::Python));
        assert_eq!(" js ".parse::<Language>(), Ok(Language::JavaScript));
        assert_eq!(
            "brainfuck".parse::<Language>(),
            Err(UnknownLanguage("brainfuck".to_string()))
        );
    }

    #[test]
    fn test_display_round_trips_through_from_str() {
        for language in Language::ALL {
            assert_eq!(language.to_string().parse::<Language>(), Ok(language));
        }
    }

    #[test]
    fn test_template_substitution() {
        let toolchain = Language::C.default_toolchain();
        assert_eq!(
            toolchain.compile_command().unwrap(),
            vec!["gcc", "-O2", "-std=c17", "-o", "main", "main.c", "-lm"]
        );
        assert_eq!(toolchain.run_command(), vec!["./main"]);
    }

    #[test]
    fn test_overrides_replace_defaults() {
        let mut overrides = HashMap::new();
        overrides.insert(
            Language::Python,
            LanguageOverride {
                source_file: Some("solution.py".to_string()),
                compile: Some(vec![]),
                run: Some(vec!["pypy3".to_string(), "%SOURCE%".to_string()]),
            },
        );
        let toolchains = Toolchains::new(&overrides);

        let python = toolchains.get(Language::Python).unwrap();
        assert_eq!(python.compile_command(), None);
        assert_eq!(python.run_command(), vec!["pypy3", "solution.py"]);
        assert_eq!(
            toolchains.get(Language::Rust),
            Some(&Language::Rust.default_toolchain())
        );
        assert_eq!(toolchains.languages().len(), Language::ALL.len());
    }
}
