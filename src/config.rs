use crate::error::{QleverError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const DEFAULT_SECTION: &str = "DEFAULT";

/// Literal tokens recognized as `true` for boolean options.
pub const YES_VALUES: [&str; 3] = ["1", "true", "yes"];

const MAX_INTERPOLATION_DEPTH: usize = 10;

/// Built-in defaults, injected for every option that is missing or empty.
/// `docker.container_*` are derived from the dataset name in `with_defaults`.
const DEFAULTS: &[(&str, &[(&str, &str)])] = &[
    ("general", &[("log_level", "info")]),
    (
        "server",
        &[
            ("binary", "ServerMain"),
            ("num_threads", "8"),
            ("cache_max_size_gb", "5"),
            ("cache_max_size_gb_single_entry", "1"),
            ("cache_max_num_entries", "100"),
            ("with_text_index", "no"),
            ("only_pso_and_pos_permutations", "no"),
            ("no_patterns", "no"),
            ("access_token", ""),
        ],
    ),
    (
        "index",
        &[
            ("binary", "IndexBuilderMain"),
            ("with_text_index", "no"),
            ("only_pso_and_pos_permutations", "no"),
            ("no_patterns", "no"),
            ("settings_json", "{}"),
        ],
    ),
    (
        "docker",
        &[("use_docker", "false"), ("image", "adfreiburg/qlever")],
    ),
    ("ui", &[("port", "7000")]),
    ("data", &[]),
];

/// Top level of the file, in document order.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct RawQleverfile(serde_yaml::Mapping);

/// Parsed Qleverfile: `section -> option -> value` plus the `DEFAULT`
/// section every other section inherits from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    defaults: BTreeMap<String, String>,
    sections: BTreeMap<String, BTreeMap<String, String>>,
    /// Section names as they appear in the file, then built-in ones.
    order: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| QleverError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let raw: RawQleverfile = if content.trim().is_empty() {
            RawQleverfile(serde_yaml::Mapping::new())
        } else {
            serde_yaml::from_str(content)?
        };
        let mut defaults = BTreeMap::new();
        let mut sections = BTreeMap::new();
        let mut order = Vec::new();
        for (section, options) in raw.0 {
            let section = scalar_to_string("(top level)", "section name", section)?;
            let options: Option<BTreeMap<String, serde_yaml::Value>> =
                serde_yaml::from_value(options)?;
            let options: BTreeMap<String, String> = options
                .unwrap_or_default()
                .into_iter()
                .map(|(option, value)| {
                    scalar_to_string(&section, &option, value).map(|value| (option.to_lowercase(), value))
                })
                .collect::<Result<_>>()?;
            if section == DEFAULT_SECTION {
                defaults = options;
            } else {
                order.push(section.clone());
                sections.insert(section, options);
            }
        }
        let cfg = Config {
            defaults,
            sections,
            order,
        };
        cfg.name()?;
        Ok(cfg.with_defaults())
    }

    /// Injects the built-in defaults. Applying this to an already merged
    /// configuration changes nothing.
    pub fn with_defaults(mut self) -> Self {
        let name = self.defaults.get("name").cloned().unwrap_or_default();
        let computed = [
            ("container_server", format!("qlever.server.{name}")),
            ("container_indexer", format!("qlever.indexer.{name}")),
        ];
        for (section, options) in DEFAULTS {
            if !self.sections.contains_key(*section) {
                self.order.push(section.to_string());
            }
            let entries = self.sections.entry(section.to_string()).or_default();
            let computed: &[(&str, String)] = if *section == "docker" { &computed } else { &[] };
            let options = options
                .iter()
                .map(|(option, value)| (*option, *value))
                .chain(computed.iter().map(|(option, value)| (*option, value.as_str())));
            for (option, value) in options {
                // A non-empty value in DEFAULT is inherited and wins over the built-in.
                let inherited = self.defaults.get(option).is_some_and(|value| !value.is_empty());
                if !inherited {
                    fill_if_empty(entries, option, value);
                }
            }
        }
        self
    }

    /// The dataset name, `DEFAULT.name`.
    pub fn name(&self) -> Result<String> {
        match self.defaults.get("name") {
            Some(value) if !value.trim().is_empty() => self.interpolate(DEFAULT_SECTION, "name", value, 0),
            _ => Err(QleverError::missing_option(DEFAULT_SECTION, "name")),
        }
    }

    fn raw(&self, section: &str, option: &str) -> Result<Option<&String>> {
        let option = option.to_lowercase();
        if section == DEFAULT_SECTION {
            return Ok(self.defaults.get(&option));
        }
        let entries = self
            .sections
            .get(section)
            .ok_or_else(|| QleverError::MissingSection(section.to_string()))?;
        Ok(entries.get(&option).or_else(|| self.defaults.get(&option)))
    }

    /// Merged, interpolated value of a required option.
    pub fn get(&self, section: &str, option: &str) -> Result<String> {
        match self.raw(section, option)? {
            Some(value) => self.interpolate(section, option, value, 0),
            None => Err(QleverError::missing_option(section, option)),
        }
    }

    /// Like `get`, but an absent or empty option is `None`.
    pub fn get_optional(&self, section: &str, option: &str) -> Result<Option<String>> {
        match self.raw(section, option)? {
            Some(value) if !value.is_empty() => {
                let value = self.interpolate(section, option, value, 0)?;
                Ok(if value.is_empty() { None } else { Some(value) })
            }
            _ => Ok(None),
        }
    }

    /// A required option that is present but empty is treated as missing.
    pub fn get_required(&self, section: &str, option: &str) -> Result<String> {
        self.get_optional(section, option)?
            .ok_or_else(|| QleverError::missing_option(section, option))
    }

    pub fn is_true(&self, section: &str, option: &str) -> Result<bool> {
        let value = self.get(section, option)?;
        Ok(YES_VALUES.contains(&value.as_str()))
    }

    /// Overrides an existing option. Unknown sections and options are
    /// rejected; an option inherited from `DEFAULT` counts as existing.
    pub fn set(mut self, section: &str, option: &str, value: &str) -> Result<Self> {
        let option = option.to_lowercase();
        if section == DEFAULT_SECTION {
            if !self.defaults.contains_key(&option) {
                return Err(QleverError::UnknownOption {
                    section: section.to_string(),
                    option,
                });
            }
            self.defaults.insert(option, value.to_string());
            return Ok(self);
        }
        let inherited = self.defaults.contains_key(&option);
        let entries = self
            .sections
            .get_mut(section)
            .ok_or_else(|| QleverError::UnknownSection(section.to_string()))?;
        if !entries.contains_key(&option) && !inherited {
            return Err(QleverError::UnknownOption {
                section: section.to_string(),
                option,
            });
        }
        entries.insert(option, value.to_string());
        Ok(self)
    }

    /// Section names in Qleverfile order followed by the built-in sections
    /// the file omits. `DEFAULT` is excluded.
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Options defined directly in a section (not inherited), uninterpolated.
    pub fn own_options(&self, section: &str) -> Vec<(&str, &str)> {
        let entries = if section == DEFAULT_SECTION {
            Some(&self.defaults)
        } else {
            self.sections.get(section)
        };
        entries
            .map(|entries| {
                entries
                    .iter()
                    .map(|(option, value)| (option.as_str(), value.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn interpolate(&self, section: &str, option: &str, value: &str, depth: usize) -> Result<String> {
        if !value.contains('$') {
            return Ok(value.to_string());
        }
        let fail = |reason: String| QleverError::Interpolation {
            section: section.to_string(),
            option: option.to_string(),
            reason,
        };
        if depth > MAX_INTERPOLATION_DEPTH {
            return Err(fail("too many nested references".to_string()));
        }
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            if let Some(tail) = after.strip_prefix('$') {
                out.push('$');
                rest = tail;
                continue;
            }
            let Some(body) = after.strip_prefix('{') else {
                return Err(fail(format!("'$' must be followed by '$' or '{{', found: {rest}")));
            };
            let Some(end) = body.find('}') else {
                return Err(fail(format!("unterminated reference: {rest}")));
            };
            let reference = &body[..end];
            let (ref_section, ref_option) = match reference.split_once(':') {
                Some((ref_section, ref_option)) => (ref_section, ref_option),
                None => (section, reference),
            };
            let raw = self
                .raw(ref_section, ref_option)?
                .ok_or_else(|| fail(format!("no option for reference ${{{reference}}}")))?;
            out.push_str(&self.interpolate(ref_section, ref_option, raw, depth + 1)?);
            rest = &body[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn fill_if_empty(entries: &mut BTreeMap<String, String>, option: &str, value: &str) {
    let current = entries.entry(option.to_string()).or_default();
    if current.is_empty() {
        *current = value.to_string();
    }
}

fn scalar_to_string(section: &str, option: &str, value: serde_yaml::Value) -> Result<String> {
    match value {
        serde_yaml::Value::Null => Ok(String::new()),
        serde_yaml::Value::Bool(value) => Ok(value.to_string()),
        serde_yaml::Value::Number(value) => Ok(value.to_string()),
        serde_yaml::Value::String(value) => Ok(value),
        other => Err(QleverError::invalid_value(
            section,
            option,
            &format!("{other:?}"),
            "expected a scalar value",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MINIMAL: &str = "DEFAULT:\n  name: olympics\nserver:\n  port: 7019\n  memory_for_queries_gb: 4\n";

    #[test]
    fn defaults_are_injected() {
        let cfg = Config::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(cfg.get("server", "num_threads").unwrap(), "8");
        assert_eq!(cfg.get("server", "cache_max_size_gb").unwrap(), "5");
        assert_eq!(cfg.get("server", "port").unwrap(), "7019");
        assert_eq!(cfg.get("index", "binary").unwrap(), "IndexBuilderMain");
        assert_eq!(cfg.get("docker", "image").unwrap(), "adfreiburg/qlever");
        assert_eq!(cfg.get("general", "log_level").unwrap(), "info");
        assert_eq!(cfg.get("ui", "port").unwrap(), "7000");
        assert!(cfg.sections().any(|section| section == "data"));
    }

    #[test]
    fn container_names_derive_from_dataset() {
        let cfg = Config::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(
            cfg.get("docker", "container_server").unwrap(),
            "qlever.server.olympics"
        );
        assert_eq!(
            cfg.get("docker", "container_indexer").unwrap(),
            "qlever.indexer.olympics"
        );
    }

    #[test]
    fn explicit_values_win_over_defaults() {
        let yaml = "DEFAULT:\n  name: x\nserver:\n  num_threads: 2\ndocker:\n  container_server: mine\n";
        let cfg = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.get("server", "num_threads").unwrap(), "2");
        assert_eq!(cfg.get("docker", "container_server").unwrap(), "mine");
    }

    #[test]
    fn empty_values_are_replaced_by_defaults() {
        let yaml = "DEFAULT:\n  name: x\nserver:\n  binary:\n";
        let cfg = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.get("server", "binary").unwrap(), "ServerMain");
    }

    #[test]
    fn merging_defaults_is_idempotent() {
        let cfg = Config::from_yaml_str(MINIMAL).unwrap();
        let again = cfg.clone().with_defaults();
        assert_eq!(cfg, again);
        assert_eq!(again.clone().with_defaults(), again);
    }

    #[test]
    fn name_is_required() {
        let err = Config::from_yaml_str("server:\n  port: 1\n").unwrap_err();
        assert!(matches!(err, QleverError::MissingOption { ref option, .. } if option == "name"));
    }

    #[test]
    fn missing_options_and_sections_fail() {
        let cfg = Config::from_yaml_str("DEFAULT:\n  name: x\n").unwrap();
        assert!(matches!(
            cfg.get("server", "port"),
            Err(QleverError::MissingOption { .. })
        ));
        assert!(matches!(
            cfg.get("nope", "port"),
            Err(QleverError::MissingSection(_))
        ));
        assert!(matches!(
            cfg.get_required("server", "access_token"),
            Err(QleverError::MissingOption { .. })
        ));
        assert_eq!(cfg.get_optional("server", "access_token").unwrap(), None);
    }

    #[test]
    fn default_section_is_inherited() {
        let yaml = "DEFAULT:\n  name: x\n  port: 7001\nui:\n  port: 7000\n";
        let cfg = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.get("server", "port").unwrap(), "7001");
        assert_eq!(cfg.get("ui", "port").unwrap(), "7000");
    }

    #[test]
    fn set_overrides_existing_options_only() {
        let cfg = Config::from_yaml_str(MINIMAL).unwrap();
        let cfg = cfg.set("docker", "USE_DOCKER", "true").unwrap();
        assert!(cfg.is_true("docker", "use_docker").unwrap());

        let err = cfg.clone().set("docker", "no_such_option", "1").unwrap_err();
        assert!(matches!(err, QleverError::UnknownOption { .. }));
        let err = cfg.clone().set("nope", "port", "1").unwrap_err();
        assert!(matches!(err, QleverError::UnknownSection(_)));
    }

    #[test]
    fn set_accepts_options_inherited_from_default() {
        let yaml = "DEFAULT:\n  name: x\n  port: 7001\n";
        let cfg = Config::from_yaml_str(yaml).unwrap();
        let cfg = cfg.set("server", "port", "8000").unwrap();
        assert_eq!(cfg.get("server", "port").unwrap(), "8000");
        assert_eq!(cfg.get("ui", "port").unwrap(), "7001");
    }

    #[test]
    fn truthy_values_are_exact_tokens() {
        let yaml = "DEFAULT:\n  name: x\nserver:\n  no_patterns: \"yes\"\n  with_text_index: \"True\"\n";
        let cfg = Config::from_yaml_str(yaml).unwrap();
        assert!(cfg.is_true("server", "no_patterns").unwrap());
        assert!(!cfg.is_true("server", "with_text_index").unwrap());
        assert!(!cfg.is_true("docker", "use_docker").unwrap());
    }

    #[test]
    fn yaml_booleans_and_numbers_are_stringified() {
        let yaml = "DEFAULT:\n  name: x\ndocker:\n  use_docker: true\nserver:\n  memory_for_queries_gb: 2.5\n";
        let cfg = Config::from_yaml_str(yaml).unwrap();
        assert!(cfg.is_true("docker", "use_docker").unwrap());
        assert_eq!(cfg.get("server", "memory_for_queries_gb").unwrap(), "2.5");
    }

    #[test]
    fn interpolation_resolves_references() {
        let yaml = concat!(
            "DEFAULT:\n  name: wikidata\n",
            "data:\n  base: https://example.org\n  url: ${base}/${DEFAULT:name}.nt\n  price: 5$$\n",
            "index:\n  file_names: ${DEFAULT:name}.*.nt\n  cat_files: cat ${file_names}\n",
        );
        let cfg = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(
            cfg.get("data", "url").unwrap(),
            "https://example.org/wikidata.nt"
        );
        assert_eq!(cfg.get("data", "price").unwrap(), "5$");
        assert_eq!(cfg.get("index", "cat_files").unwrap(), "cat wikidata.*.nt");
    }

    #[test]
    fn interpolation_sees_later_assignments() {
        let yaml = "DEFAULT:\n  name: x\nindex:\n  file_names: ${DEFAULT:name}.nt\n";
        let cfg = Config::from_yaml_str(yaml).unwrap();
        let cfg = cfg.set("DEFAULT", "name", "y").unwrap();
        assert_eq!(cfg.get("index", "file_names").unwrap(), "y.nt");
    }

    #[test]
    fn interpolation_errors_are_reported() {
        let yaml = "DEFAULT:\n  name: x\ndata:\n  a: ${b}\n  b: ${a}\n  c: ${\n  d: ${missing}\n";
        let cfg = Config::from_yaml_str(yaml).unwrap();
        for option in ["a", "c", "d"] {
            assert!(matches!(
                cfg.get("data", option),
                Err(QleverError::Interpolation { .. })
            ));
        }
    }

    #[test]
    fn nested_mappings_are_rejected() {
        let yaml = "DEFAULT:\n  name: x\nserver:\n  port:\n    a: 1\n";
        assert!(matches!(
            Config::from_yaml_str(yaml),
            Err(QleverError::InvalidValue { .. })
        ));
    }

    #[test]
    fn sections_keep_file_order() {
        let yaml = "DEFAULT:\n  name: x\nserver:\n  port: 1\ndata:\n  get_data_cmd: true\nindex:\n  file_names: x.nt\n";
        let cfg = Config::from_yaml_str(yaml).unwrap();
        let sections: Vec<&str> = cfg.sections().collect();
        assert_eq!(
            sections,
            vec!["server", "data", "index", "general", "docker", "ui"]
        );
        assert_eq!(cfg.clone().with_defaults().sections().count(), 6);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempdir().unwrap();
        let err = Config::load(&dir.path().join("Qleverfile.yaml")).unwrap_err();
        assert!(matches!(err, QleverError::ConfigFile { .. }));
    }

    #[test]
    fn own_options_skip_inherited_values() {
        let yaml = "DEFAULT:\n  name: x\n  port: 1\nserver:\n  port: 2\n";
        let cfg = Config::from_yaml_str(yaml).unwrap();
        let server = cfg.own_options("server");
        assert!(server.contains(&("port", "2")));
        assert!(!server.iter().any(|(option, _)| *option == "name"));
        assert_eq!(cfg.own_options(DEFAULT_SECTION).len(), 2);
    }
}
