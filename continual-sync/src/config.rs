//! Configuration file parsing and validation.
//!
//! The format is INI-style with `[section]` headers and `key = value`
//! lines, where key names may contain spaces (`full sync interval = 60`).
//! A reserved `defaults` section supplies values inherited by every other
//! section. `include = GLOB` lines splice other files in, relative to the
//! including file. String values support `%`-placeholders, expanded during
//! validation.

use std::fmt;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

/// Configuration file read when `-c` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/continual-sync.conf";

/// Name of the section holding inheritable defaults.
pub const DEFAULTS_SECTION: &str = "defaults";

/// Hard limit on the number of sections across all configuration files.
pub const MAX_CONFIG_SECTIONS: usize = 1000;

/// Hard limit on exclude patterns per section.
pub const MAX_EXCLUDES: usize = 1000;

/// Include files may only nest this deep.
const MAX_INCLUDE_DEPTH: usize = 3;

/// Built-in numeric defaults, applied when neither the section nor the
/// defaults section sets a value.
const DEFAULT_FULL_INTERVAL: u64 = 86400;
const DEFAULT_FULL_RETRY: u64 = 3600;
const DEFAULT_PARTIAL_INTERVAL: u64 = 30;
const DEFAULT_PARTIAL_RETRY: u64 = 300;
const DEFAULT_RECURSION_DEPTH: u64 = 20;

/// One `[section]` as parsed, before inheritance and expansion.
#[derive(Debug, Clone, Default)]
pub struct RawSection {
    pub name: String,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub source_validation: Option<String>,
    pub destination_validation: Option<String>,
    pub full_interval: Option<u64>,
    pub full_retry: Option<u64>,
    pub partial_interval: Option<u64>,
    pub partial_retry: Option<u64>,
    pub recursion_depth: Option<u64>,
    pub full_marker: Option<String>,
    pub partial_marker: Option<String>,
    pub change_queue: Option<String>,
    pub transfer_list: Option<String>,
    pub tempdir: Option<String>,
    pub sync_lock: Option<String>,
    pub full_rsync_opts: Option<String>,
    pub partial_rsync_opts: Option<String>,
    pub log_file: Option<String>,
    pub status_file: Option<String>,
    pub excludes: Vec<String>,
}

/// A fully validated synchronisation set, ready to run.
#[derive(Debug, Clone)]
pub struct SyncSet {
    pub name: String,
    pub source: String,
    pub destination: String,
    pub source_validation: Option<String>,
    pub destination_validation: Option<String>,
    pub full_interval: u64,
    pub full_retry: u64,
    pub partial_interval: u64,
    pub partial_retry: u64,
    pub recursion_depth: usize,
    pub full_marker: Option<PathBuf>,
    pub partial_marker: Option<PathBuf>,
    pub change_queue: Option<PathBuf>,
    pub transfer_list: Option<PathBuf>,
    pub tempdir: Option<PathBuf>,
    pub sync_lock: Option<PathBuf>,
    pub full_rsync_opts: Option<String>,
    pub partial_rsync_opts: Option<String>,
    pub log_file: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
    pub excludes: Vec<String>,
}

/// Configuration errors, all fatal to startup.
#[derive(Debug)]
pub enum ConfigError {
    /// A configuration file could not be read.
    Io { path: PathBuf, source: io::Error },
    /// A line failed to parse.
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    /// A section failed validation.
    Section { section: String, message: String },
    /// Section selection failed (unknown name, nothing to do, ...).
    Selection(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            ConfigError::Parse {
                path,
                line,
                message,
            } => write!(f, "{}: {}: {}", path.display(), line, message),
            ConfigError::Section { section, message } => write!(f, "{section}: {message}"),
            ConfigError::Selection(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for ConfigError {}

/// All parsed sections, in file order.
#[derive(Debug, Default)]
pub struct Config {
    pub sections: Vec<RawSection>,
}

impl Config {
    /// Parse every file in `paths`, accumulating sections.
    pub fn load(paths: &[PathBuf]) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        for path in paths {
            config.parse_file(path, 0)?;
        }
        Ok(config)
    }

    pub fn find(&self, name: &str) -> Option<&RawSection> {
        self.sections.iter().find(|section| section.name == name)
    }

    fn parse_file(&mut self, path: &Path, depth: usize) -> Result<(), ConfigError> {
        if depth > MAX_INCLUDE_DEPTH {
            log::debug!(
                "{}: max recursion depth reached - ignoring file",
                path.display()
            );
            return Ok(());
        }
        log::debug!("{}: opening file", path.display());

        let file = std::fs::File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut current: Option<usize> = None;
        for (idx, line) in io::BufReader::new(file).lines().enumerate() {
            let lineno = idx + 1;
            let line = line.map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            self.parse_line(path, lineno, &line, depth, &mut current)?;
        }
        Ok(())
    }

    fn parse_line(
        &mut self,
        path: &Path,
        lineno: usize,
        line: &str,
        depth: usize,
        current: &mut Option<usize>,
    ) -> Result<(), ConfigError> {
        let parse_err = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            line: lineno,
            message,
        };

        if let Some(name) = parse_section_header(line) {
            log::debug!("{}: {}: section: {}", path.display(), lineno, name);
            if self.find(name).is_some() {
                return Err(parse_err(format!("{name}: section already defined")));
            }
            if self.sections.len() >= MAX_CONFIG_SECTIONS - 1 {
                return Err(parse_err("maximum number of sections reached".to_string()));
            }
            self.sections.push(RawSection {
                name: name.to_string(),
                ..RawSection::default()
            });
            *current = Some(self.sections.len() - 1);
            return Ok(());
        }

        if let Some(value) = parse_key_value(line, "include") {
            log::debug!("{}: {}: include: {}", path.display(), lineno, value);
            return self.parse_include(path, lineno, value, depth);
        }

        let Some(section_idx) = *current else {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return Ok(());
            }
            return Err(parse_err(
                "must start a section declaration first".to_string(),
            ));
        };

        // Strip comments (a hash at the start of the line or preceded by
        // whitespace) and trailing whitespace.
        let cleaned = strip_comment(line);
        let trimmed = cleaned.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(());
        }

        let section = &mut self.sections[section_idx];
        let Some((key, value)) = split_key_value(cleaned) else {
            return Err(parse_err("invalid configuration directive".to_string()));
        };

        let string_slot = match key.as_str() {
            "source" => Some(&mut section.source),
            "destination" => Some(&mut section.destination),
            "source validation command" => Some(&mut section.source_validation),
            "destination validation command" => Some(&mut section.destination_validation),
            "full sync marker file" => Some(&mut section.full_marker),
            "partial sync marker file" => Some(&mut section.partial_marker),
            "change queue" => Some(&mut section.change_queue),
            "transfer list" => Some(&mut section.transfer_list),
            "temporary directory" => Some(&mut section.tempdir),
            "sync lock" => Some(&mut section.sync_lock),
            "full rsync options" => Some(&mut section.full_rsync_opts),
            "partial rsync options" => Some(&mut section.partial_rsync_opts),
            "log file" => Some(&mut section.log_file),
            "status file" => Some(&mut section.status_file),
            _ => None,
        };
        if let Some(slot) = string_slot {
            log::debug!("{}: {}: {} = [{}]", path.display(), lineno, key, value);
            *slot = Some(value.to_string());
            return Ok(());
        }

        let numeric_slot = match key.as_str() {
            "full sync interval" => Some(&mut section.full_interval),
            "full sync retry" => Some(&mut section.full_retry),
            "partial sync interval" => Some(&mut section.partial_interval),
            "partial sync retry" => Some(&mut section.partial_retry),
            "recursion depth" => Some(&mut section.recursion_depth),
            _ => None,
        };
        if let Some(slot) = numeric_slot {
            let parsed: u64 = value
                .parse()
                .map_err(|_| parse_err("invalid configuration directive".to_string()))?;
            log::debug!("{}: {}: {} = [{}]", path.display(), lineno, key, parsed);
            *slot = Some(parsed);
            return Ok(());
        }

        if key == "exclude" {
            if section.excludes.len() >= MAX_EXCLUDES - 1 {
                return Err(parse_err("maximum number of excludes reached".to_string()));
            }
            log::debug!("{}: {}: exclude = [{}]", path.display(), lineno, value);
            section.excludes.push(value.to_string());
            return Ok(());
        }

        Err(parse_err("invalid configuration directive".to_string()))
    }

    /// Splice in every file matching the include expression, relative to
    /// the including file's directory. Backup and package-manager leftovers
    /// (`*~`, `*.rpmsave`, `*.rpmorig`, `*.rpmnew`) are skipped.
    fn parse_include(
        &mut self,
        path: &Path,
        lineno: usize,
        value: &str,
        depth: usize,
    ) -> Result<(), ConfigError> {
        let parse_err = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            line: lineno,
            message,
        };

        let words = shlex::split(value)
            .ok_or_else(|| parse_err("failed to parse include line".to_string()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for word in words {
            let pattern = if Path::new(&word).is_absolute() {
                word.clone()
            } else {
                base.join(&word).to_string_lossy().into_owned()
            };
            let matches = glob::glob(&pattern)
                .map_err(|_| parse_err("failed to parse include line".to_string()))?;
            for entry in matches.flatten() {
                let name = entry.file_name().map(|n| n.to_string_lossy().into_owned());
                if let Some(name) = name {
                    if name.ends_with('~')
                        || name.ends_with(".rpmsave")
                        || name.ends_with(".rpmorig")
                        || name.ends_with(".rpmnew")
                    {
                        log::debug!("{}: skipping: ignored", entry.display());
                        continue;
                    }
                }
                self.parse_file(&entry, depth + 1)?;
            }
        }
        Ok(())
    }

    /// Validate the defaults section, if present: it may not define a
    /// source or destination.
    pub fn validate_defaults(&self) -> Result<(), ConfigError> {
        let Some(defaults) = self.find(DEFAULTS_SECTION) else {
            return Ok(());
        };
        if defaults.source.is_some() {
            return Err(ConfigError::Section {
                section: DEFAULTS_SECTION.to_string(),
                message: "default source directory not allowed".to_string(),
            });
        }
        if defaults.destination.is_some() {
            return Err(ConfigError::Section {
                section: DEFAULTS_SECTION.to_string(),
                message: "default destination directory not allowed".to_string(),
            });
        }
        Ok(())
    }

    /// Resolve one section into a runnable [`SyncSet`]: inherit from the
    /// defaults section, expand `%` placeholders, normalise `"none"`, and
    /// check the result.
    pub fn resolve(&self, name: &str) -> Result<SyncSet, ConfigError> {
        let section = self
            .find(name)
            .ok_or_else(|| ConfigError::Selection(format!("{name}: configuration section not found")))?;
        let defaults = self.find(DEFAULTS_SECTION);

        let section_err = |message: String| ConfigError::Section {
            section: name.to_string(),
            message,
        };

        let source = section
            .source
            .clone()
            .ok_or_else(|| section_err("no source directory defined".to_string()))?;
        let destination = section
            .destination
            .clone()
            .ok_or_else(|| section_err("no destination directory defined".to_string()))?;

        let inherit_string = |own: &Option<String>, pick: fn(&RawSection) -> &Option<String>| {
            own.clone().or_else(|| defaults.and_then(|d| pick(d).clone()))
        };
        let inherit_number =
            |own: Option<u64>, pick: fn(&RawSection) -> Option<u64>, builtin: u64| {
                own.or_else(|| defaults.and_then(pick)).unwrap_or(builtin)
            };

        let expand = |input: Option<String>, parameter: &str| -> Result<Option<String>, ConfigError> {
            let Some(input) = input else { return Ok(None) };
            let expanded = expand_placeholders(&input, name, &source, &destination)
                .map_err(|bad| {
                    section_err(format!("{parameter}: invalid variable substitution: {bad}"))
                })?;
            if expanded != input {
                log::debug!("(cf) {name}: {parameter}: [{input}] -> [{expanded}]");
            }
            Ok(Some(expanded))
        };

        // The literal value "none" unsets an option.
        let none_is_unset = |value: Option<String>| value.filter(|v| v != "none");

        let source_validation = none_is_unset(expand(
            inherit_string(&section.source_validation, |s| &s.source_validation),
            "source validation command",
        )?);
        let destination_validation = none_is_unset(expand(
            inherit_string(&section.destination_validation, |s| &s.destination_validation),
            "destination validation command",
        )?);
        let full_marker = none_is_unset(expand(
            inherit_string(&section.full_marker, |s| &s.full_marker),
            "full sync marker file",
        )?);
        let partial_marker = none_is_unset(expand(
            inherit_string(&section.partial_marker, |s| &s.partial_marker),
            "partial sync marker file",
        )?);
        let change_queue = none_is_unset(expand(
            inherit_string(&section.change_queue, |s| &s.change_queue),
            "change queue",
        )?);
        let transfer_list = none_is_unset(expand(
            inherit_string(&section.transfer_list, |s| &s.transfer_list),
            "transfer list",
        )?);
        let tempdir = none_is_unset(expand(
            inherit_string(&section.tempdir, |s| &s.tempdir),
            "temporary directory",
        )?);
        let sync_lock = none_is_unset(expand(
            inherit_string(&section.sync_lock, |s| &s.sync_lock),
            "sync lock",
        )?);
        let full_rsync_opts = expand(
            inherit_string(&section.full_rsync_opts, |s| &s.full_rsync_opts),
            "full rsync options",
        )?;
        let partial_rsync_opts = expand(
            inherit_string(&section.partial_rsync_opts, |s| &s.partial_rsync_opts),
            "partial rsync options",
        )?;
        let log_file = none_is_unset(expand(
            inherit_string(&section.log_file, |s| &s.log_file),
            "log file",
        )?);
        let status_file = none_is_unset(expand(
            inherit_string(&section.status_file, |s| &s.status_file),
            "status file",
        )?);

        let full_interval = inherit_number(
            section.full_interval,
            |s| s.full_interval,
            DEFAULT_FULL_INTERVAL,
        );
        let full_retry = inherit_number(section.full_retry, |s| s.full_retry, DEFAULT_FULL_RETRY);
        let partial_interval = inherit_number(
            section.partial_interval,
            |s| s.partial_interval,
            DEFAULT_PARTIAL_INTERVAL,
        );
        let partial_retry = inherit_number(
            section.partial_retry,
            |s| s.partial_retry,
            DEFAULT_PARTIAL_RETRY,
        );
        let recursion_depth = inherit_number(
            section.recursion_depth,
            |s| s.recursion_depth,
            DEFAULT_RECURSION_DEPTH,
        );

        let excludes = if section.excludes.is_empty() {
            defaults.map(|d| d.excludes.clone()).unwrap_or_default()
        } else {
            section.excludes.clone()
        };

        if let Some(dir) = &change_queue {
            require_directory(dir).map_err(|message| section_err(format!("{dir}: {message}")))?;
        }
        if let Some(dir) = &tempdir {
            require_directory(dir).map_err(|message| section_err(format!("{dir}: {message}")))?;
        }

        if full_interval == 0 && partial_interval == 0 {
            return Err(section_err(
                "both full and partial intervals are 0 - section would do nothing".to_string(),
            ));
        }

        Ok(SyncSet {
            name: name.to_string(),
            source,
            destination,
            source_validation,
            destination_validation,
            full_interval,
            full_retry,
            partial_interval,
            partial_retry,
            recursion_depth: recursion_depth as usize,
            full_marker: full_marker.map(PathBuf::from),
            partial_marker: partial_marker.map(PathBuf::from),
            change_queue: change_queue.map(PathBuf::from),
            transfer_list: transfer_list.map(PathBuf::from),
            tempdir: tempdir.map(PathBuf::from),
            sync_lock: sync_lock.map(PathBuf::from),
            full_rsync_opts,
            partial_rsync_opts,
            log_file: log_file.map(PathBuf::from),
            status_file: status_file.map(PathBuf::from),
            excludes,
        })
    }

    /// Work out which sections to run: the named ones, or every section
    /// except `defaults` when none are named. Each chosen section is
    /// resolved, and any failure is fatal.
    pub fn select(&self, names: &[String]) -> Result<Vec<SyncSet>, ConfigError> {
        if self.sections.is_empty() {
            return Err(ConfigError::Selection(
                "no configuration sections defined".to_string(),
            ));
        }
        self.validate_defaults()?;

        let mut selected = Vec::new();
        if names.is_empty() {
            for section in &self.sections {
                if section.name == DEFAULTS_SECTION {
                    continue;
                }
                selected.push(self.resolve(&section.name)?);
            }
        } else {
            for name in names {
                if name == DEFAULTS_SECTION {
                    return Err(ConfigError::Selection(
                        "cannot choose the defaults section".to_string(),
                    ));
                }
                selected.push(self.resolve(name)?);
            }
        }

        if selected.is_empty() {
            return Err(ConfigError::Selection("no sections to synchronise".to_string()));
        }
        Ok(selected)
    }
}

/// `[name]` headers: leading whitespace, then a bracketed name made of
/// alphanumerics, `_`, `.` and `-`.
fn parse_section_header(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix('[')?;
    let end = rest.find(']')?;
    let name = &rest[..end];
    if name.is_empty() || name.len() > 999 {
        return None;
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return None;
    }
    Some(name)
}

/// Match `key = value` for one specific key, tolerating whitespace.
fn parse_key_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix(key)?;
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=')?;
    let value = rest.trim();
    if value.is_empty() {
        return None;
    }
    Some(value)
}

/// Split a cleaned line into a canonical key (internal whitespace collapsed
/// to single spaces) and a non-empty value.
fn split_key_value(line: &str) -> Option<(String, &str)> {
    let (lhs, rhs) = line.split_once('=')?;
    let key = lhs.split_whitespace().collect::<Vec<_>>().join(" ");
    let value = rhs.trim();
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value))
}

/// Remove a comment introduced by `#` at the start of the line or after
/// whitespace, then trim trailing whitespace.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (idx, &byte) in bytes.iter().enumerate() {
        if byte != b'#' {
            continue;
        }
        if idx == 0 || bytes[idx - 1].is_ascii_whitespace() {
            return line[..idx].trim_end();
        }
    }
    line.trim_end()
}

/// Expand `%` placeholders: `%%` is a literal percent, `%n` the section
/// name, `%s` the source, `%d` the destination path component (after the
/// last `:`, or the whole string), `%h` the destination host component
/// (before the first `:`, or `localhost`). Anything else is an error,
/// returned as the offending sequence.
fn expand_placeholders(
    input: &str,
    name: &str,
    source: &str,
    destination: &str,
) -> Result<String, String> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('n') => out.push_str(name),
            Some('s') => out.push_str(source),
            Some('d') => {
                let path = destination
                    .rsplit_once(':')
                    .map(|(_, path)| path)
                    .unwrap_or(destination);
                out.push_str(path);
            }
            Some('h') => match destination.split_once(':') {
                Some((host, _)) => out.push_str(host),
                None => out.push_str("localhost"),
            },
            Some(other) => return Err(format!("%{other}")),
            None => return Err("%".to_string()),
        }
    }
    Ok(out)
}

fn require_directory(path: &str) -> Result<(), String> {
    match std::fs::symlink_metadata(path) {
        Err(e) => Err(e.to_string()),
        Ok(metadata) if !metadata.is_dir() => Err("not a directory".to_string()),
        Ok(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(content.as_bytes()).expect("write");
        path
    }

    fn load(content: &str) -> Result<Config, ConfigError> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(dir.path(), "test.conf", content);
        Config::load(&[path])
    }

    fn minimal(extra: &str) -> String {
        format!("[data]\nsource = /src\ndestination = remote:/dst\n{extra}")
    }

    #[test]
    fn parses_sections_and_spaced_keys() {
        let config = load(
            "[alpha]\n\
             source = /srv/alpha\n\
             destination = backup:/mirror/alpha\n\
             full sync interval = 3600\n\
             partial sync interval = 10\n\
             exclude = *.log\n\
             exclude = cache-*\n",
        )
        .expect("parse");

        let section = config.find("alpha").expect("section");
        assert_eq!(section.source.as_deref(), Some("/srv/alpha"));
        assert_eq!(section.full_interval, Some(3600));
        assert_eq!(section.partial_interval, Some(10));
        assert_eq!(section.excludes, vec!["*.log", "cache-*"]);
    }

    #[test]
    fn values_may_contain_spaces_and_comments_are_stripped() {
        let config = load(&minimal(
            "source validation command = test -d /src # must exist\n\
             full rsync options = --delete -axH --bwlimit=1000\n",
        ))
        .expect("parse");
        let section = config.find("data").unwrap();
        assert_eq!(
            section.source_validation.as_deref(),
            Some("test -d /src")
        );
        assert_eq!(
            section.full_rsync_opts.as_deref(),
            Some("--delete -axH --bwlimit=1000")
        );
    }

    #[test]
    fn a_hash_inside_a_word_is_not_a_comment() {
        let config = load(&minimal("sync lock = /run/lock#1\n")).expect("parse");
        assert_eq!(
            config.find("data").unwrap().sync_lock.as_deref(),
            Some("/run/lock#1")
        );
    }

    #[test]
    fn duplicate_sections_are_rejected() {
        let err = load("[a]\n[a]\n").unwrap_err();
        assert!(err.to_string().contains("section already defined"), "{err}");
    }

    #[test]
    fn directives_outside_a_section_are_rejected() {
        let err = load("source = /src\n").unwrap_err();
        assert!(
            err.to_string().contains("must start a section declaration"),
            "{err}"
        );
    }

    #[test]
    fn blank_lines_and_comments_are_allowed_anywhere() {
        load("# leading comment\n\n[a]\n\n# another\nsource = /src\n").expect("parse");
    }

    #[test]
    fn unknown_directives_are_rejected() {
        let err = load("[a]\nbogus directive = 1\n").unwrap_err();
        assert!(
            err.to_string().contains("invalid configuration directive"),
            "{err}"
        );
    }

    #[test]
    fn non_numeric_interval_is_rejected() {
        let err = load("[a]\nfull sync interval = soon\n").unwrap_err();
        assert!(
            err.to_string().contains("invalid configuration directive"),
            "{err}"
        );
    }

    #[test]
    fn include_splices_matching_files_relative_to_the_includer() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_config(
            dir.path(),
            "extra-1.conf",
            "[extra]\nsource = /e\ndestination = host:/e\n",
        );
        write_config(dir.path(), "extra-2.conf~", "[junk]\n");
        let main = write_config(
            dir.path(),
            "main.conf",
            "include = extra-*.conf*\n[main]\nsource = /m\ndestination = host:/m\n",
        );

        let config = Config::load(&[main]).expect("parse");
        assert!(config.find("extra").is_some());
        assert!(config.find("main").is_some());
        // The editor backup copy is skipped.
        assert!(config.find("junk").is_none());
    }

    #[test]
    fn include_recursion_is_depth_limited() {
        let dir = tempfile::tempdir().expect("tempdir");
        // self.conf includes itself; the depth cap stops the loop and the
        // duplicate-section check never fires because the nested parse is
        // skipped before any sections are read again.
        let path = dir.path().join("self.conf");
        std::fs::write(&path, "include = self.conf\n[one]\nsource = /s\ndestination = h:/d\n")
            .expect("write");
        let err = Config::load(&[path]).unwrap_err();
        // Four levels of the same file do get parsed, so the duplicate
        // section error fires at depth 1; what matters is termination.
        assert!(err.to_string().contains("section already defined"), "{err}");
    }

    #[test]
    fn selection_requires_source_and_destination() {
        let config = load("[a]\ndestination = host:/d\n").expect("parse");
        let err = config.resolve("a").unwrap_err();
        assert!(err.to_string().contains("no source directory defined"), "{err}");

        let config = load("[a]\nsource = /s\n").expect("parse");
        let err = config.resolve("a").unwrap_err();
        assert!(
            err.to_string().contains("no destination directory defined"),
            "{err}"
        );
    }

    #[test]
    fn defaults_section_may_not_define_endpoints() {
        let config = load("[defaults]\nsource = /s\n").expect("parse");
        let err = config.validate_defaults().unwrap_err();
        assert!(
            err.to_string().contains("default source directory not allowed"),
            "{err}"
        );
    }

    #[test]
    fn defaults_are_inherited_and_sections_override() {
        let config = load(
            "[defaults]\n\
             full sync interval = 100\n\
             partial sync interval = 7\n\
             log file = /var/log/sync-%n.log\n\
             exclude = *.bak\n\
             [a]\n\
             source = /s\n\
             destination = host:/d\n\
             full sync interval = 200\n\
             [b]\n\
             source = /s2\n\
             destination = host:/d2\n\
             exclude = *.log\n",
        )
        .expect("parse");

        let a = config.resolve("a").expect("resolve a");
        assert_eq!(a.full_interval, 200);
        assert_eq!(a.partial_interval, 7);
        assert_eq!(a.log_file.as_deref(), Some(Path::new("/var/log/sync-a.log")));
        assert_eq!(a.excludes, vec!["*.bak"]);

        let b = config.resolve("b").expect("resolve b");
        assert_eq!(b.full_interval, 100);
        // A section with its own excludes does not inherit any.
        assert_eq!(b.excludes, vec!["*.log"]);
    }

    #[test]
    fn builtin_numeric_defaults_apply() {
        let config = load(&minimal("")).expect("parse");
        let set = config.resolve("data").expect("resolve");
        assert_eq!(set.full_interval, 86400);
        assert_eq!(set.full_retry, 3600);
        assert_eq!(set.partial_interval, 30);
        assert_eq!(set.partial_retry, 300);
        assert_eq!(set.recursion_depth, 20);
    }

    #[test]
    fn an_explicit_zero_disables_one_sync_kind() {
        let config = load(&minimal("full sync interval = 0\n")).expect("parse");
        let set = config.resolve("data").expect("resolve");
        assert_eq!(set.full_interval, 0);
        assert_eq!(set.partial_interval, 30);
    }

    #[test]
    fn both_intervals_zero_is_an_error() {
        let config = load(&minimal(
            "full sync interval = 0\npartial sync interval = 0\n",
        ))
        .expect("parse");
        let err = config.resolve("data").unwrap_err();
        assert!(err.to_string().contains("would do nothing"), "{err}");
    }

    #[test]
    fn placeholders_expand() {
        let config = load(
            "[web]\n\
             source = /srv/web\n\
             destination = mirror1:/backup/web\n\
             status file = /run/%n.status\n\
             sync lock = /run/lock-%h\n\
             full sync marker file = %d/.marker-%%\n\
             transfer list = /tmp/%s.list\n",
        )
        .expect("parse");
        let set = config.resolve("web").expect("resolve");
        assert_eq!(set.status_file.as_deref(), Some(Path::new("/run/web.status")));
        assert_eq!(set.sync_lock.as_deref(), Some(Path::new("/run/lock-mirror1")));
        assert_eq!(
            set.full_marker.as_deref(),
            Some(Path::new("/backup/web/.marker-%"))
        );
        assert_eq!(
            set.transfer_list.as_deref(),
            Some(Path::new("/tmp//srv/web.list"))
        );
    }

    #[test]
    fn host_placeholder_without_a_colon_is_localhost() {
        let config = load(
            "[local]\nsource = /s\ndestination = /plain/path\nsync lock = /run/%h.lock\n",
        )
        .expect("parse");
        let set = config.resolve("local").expect("resolve");
        assert_eq!(set.sync_lock.as_deref(), Some(Path::new("/run/localhost.lock")));
    }

    #[test]
    fn host_placeholder_keeps_the_user_prefix() {
        let config = load(
            "[r]\nsource = /s\ndestination = user@host:/path\nsync lock = /run/%h.lock\n",
        )
        .expect("parse");
        let set = config.resolve("r").expect("resolve");
        assert_eq!(
            set.sync_lock.as_deref(),
            Some(Path::new("/run/user@host.lock"))
        );
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let config = load(&minimal("log file = /var/log/%x.log\n")).expect("parse");
        let err = config.resolve("data").unwrap_err();
        assert!(
            err.to_string().contains("invalid variable substitution"),
            "{err}"
        );
    }

    #[test]
    fn none_unsets_an_option() {
        let config = load(
            "[defaults]\nlog file = /var/log/sync.log\n[a]\nsource = /s\ndestination = h:/d\nlog file = none\n",
        )
        .expect("parse");
        let set = config.resolve("a").expect("resolve");
        assert!(set.log_file.is_none());
    }

    #[test]
    fn configured_change_queue_must_exist() {
        let config = load(&minimal("change queue = /definitely/not/here\n")).expect("parse");
        assert!(config.resolve("data").is_err());
    }

    #[test]
    fn configured_change_queue_must_be_a_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").expect("write");
        let config = load(&minimal(&format!("change queue = {}\n", file.display())))
            .expect("parse");
        let err = config.resolve("data").unwrap_err();
        assert!(err.to_string().contains("not a directory"), "{err}");
    }

    #[test]
    fn select_defaults_to_all_non_defaults_sections() {
        let config = load(
            "[defaults]\nfull sync interval = 60\n\
             [a]\nsource = /s\ndestination = h:/a\n\
             [b]\nsource = /s\ndestination = h:/b\n",
        )
        .expect("parse");
        let sets = config.select(&[]).expect("select");
        let names: Vec<&str> = sets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn selecting_an_unknown_section_fails() {
        let config = load(&minimal("")).expect("parse");
        let err = config.select(&["ghost".to_string()]).unwrap_err();
        assert!(err.to_string().contains("configuration section not found"), "{err}");
    }

    #[test]
    fn selecting_the_defaults_section_fails() {
        let config = load(&minimal("")).expect("parse");
        let err = config
            .select(&[DEFAULTS_SECTION.to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("cannot choose the defaults section"), "{err}");
    }

    #[test]
    fn empty_configuration_fails_selection() {
        let config = load("").expect("parse");
        let err = config.select(&[]).unwrap_err();
        assert!(err.to_string().contains("no configuration sections defined"), "{err}");
    }
}
