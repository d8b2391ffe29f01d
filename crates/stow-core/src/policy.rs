//! Storage policies: where a user's files land and how they are named.
//!
//! A policy's `dir_name_rule` and `file_name_rule` are small templates. Every
//! placeholder is expanded in a single pass; unknown placeholders are left
//! verbatim so a typo shows up in the resulting path instead of vanishing.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{StowError, StowResult};

/// Physical backend a policy stores into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local disk; destinations are absolute host paths
    #[default]
    Local,
    /// Process memory (tests and dry runs)
    Memory,
    /// Any S3-compatible object store
    S3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub id: u64,
    pub name: String,
    pub backend: BackendKind,
    /// Endpoint for remote backends
    pub server: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    /// Directory template, e.g. `/srv/stow/{uid}/{path}`
    pub dir_name_rule: String,
    /// File name template used when `auto_rename` is on
    pub file_name_rule: String,
    /// Rename uploads so they can never overwrite an existing object
    pub auto_rename: bool,
    /// Largest accepted single file in bytes (0 = unlimited)
    pub max_size: u64,
    /// Accepted extensions without the dot (empty = any)
    pub allowed_extensions: Vec<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            id: 0,
            name: "default".into(),
            backend: BackendKind::Local,
            server: None,
            bucket: None,
            region: None,
            dir_name_rule: "/var/lib/stow/uploads/{uid}/{path}".into(),
            file_name_rule: "{randomkey8}_{originname}".into(),
            auto_rename: false,
            max_size: 0,
            allowed_extensions: Vec::new(),
        }
    }
}

impl Policy {
    /// Physical directory for `virtual_path` of user `uid`.
    ///
    /// With `virtual_path = "/"` this is the user's base directory, which the
    /// reconciler walks.
    pub fn generate_path(&self, uid: u64, virtual_path: &str) -> String {
        let rendered = render(&self.dir_name_rule, |key| match key {
            "path" => Some(virtual_path.to_string()),
            "uid" => Some(uid.to_string()),
            _ => common_placeholder(key),
        });
        clean_path(&rendered)
    }

    /// Physical file name for an upload called `origin`.
    pub fn generate_file_name(&self, uid: u64, origin: &str) -> String {
        if !self.auto_rename {
            return origin.to_string();
        }

        let mut rule = self.file_name_rule.clone();
        if !has_random_component(&rule) {
            rule.insert_str(0, "{randomkey8}_");
        }

        render(&rule, |key| match key {
            "originname" => Some(origin.to_string()),
            "ext" => Some(extension(origin).to_string()),
            "uid" => Some(uid.to_string()),
            _ => common_placeholder(key),
        })
    }

    /// Full physical destination for a file named `name` in `virtual_path`.
    ///
    /// Fails unless the result lies strictly below the user's base directory,
    /// whatever `name` and `virtual_path` contain.
    pub fn destination(&self, uid: u64, virtual_path: &str, name: &str) -> StowResult<String> {
        let base = self.generate_path(uid, "/");
        let dir = self.generate_path(uid, virtual_path);
        let file = self.generate_file_name(uid, name);
        let dst = join_path(&dir, &file);
        if !is_below(&dst, &base) {
            return Err(StowError::invalid_path(
                dst,
                format!("outside base directory {base} of user {uid}"),
            ));
        }
        Ok(dst)
    }

    /// Whether `name` passes the extension allow-list.
    pub fn accepts_extension(&self, name: &str) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }
        let ext = extension(name);
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

/// Reject names that are not a single plain path segment.
pub fn check_file_name(name: &str) -> StowResult<()> {
    let reason = if name.is_empty() {
        "empty file name"
    } else if name == "." || name == ".." {
        "reserved file name"
    } else if name.contains(['/', '\\']) {
        "file name contains a path separator"
    } else if name.contains('\0') {
        "file name contains NUL"
    } else {
        return Ok(());
    };
    Err(StowError::invalid_path(name, reason))
}

/// Whether cleaned path `path` lies strictly below cleaned directory `base`.
fn is_below(path: &str, base: &str) -> bool {
    if path == base {
        return false;
    }
    match base {
        "/" => path.starts_with('/'),
        "." => path != ".." && !path.starts_with("../") && !path.starts_with('/'),
        _ => path
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('/')),
    }
}

fn has_random_component(rule: &str) -> bool {
    ["{randomkey8}", "{randomkey16}", "{uuid}"]
        .iter()
        .any(|p| rule.contains(p))
}

fn common_placeholder(key: &str) -> Option<String> {
    match key {
        "timestamp" => Some(unix_now().to_string()),
        "randomkey8" => Some(random_key(8)),
        "randomkey16" => Some(random_key(16)),
        "uuid" => Some(uuid::Uuid::new_v4().to_string()),
        _ => None,
    }
}

/// Expand `{key}` placeholders in one pass so expanded values are never
/// re-scanned.
fn render(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match lookup(key) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn random_key(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Extension of `name` without the dot, or "" if there is none.
pub fn extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(0) | None => "",
        Some(i) => &name[i + 1..],
    }
}

/// Join two forward-slash path fragments.
pub fn join_path(dir: &str, name: &str) -> String {
    clean_path(&format!("{dir}/{name}"))
}

/// Normalize a forward-slash path: collapse repeated separators, drop `.`
/// segments, resolve `..`, and strip the trailing separator.
pub fn clean_path(path: &str) -> String {
    let path = if cfg!(windows) {
        path.replace('\\', "/")
    } else {
        path.to_string()
    };
    let absolute = path.starts_with('/');

    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            s => parts.push(s),
        }
    }

    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}
