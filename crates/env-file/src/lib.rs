//! Flat `KEY=VALUE` environment files.
//!
//! The format has no quoting or escaping rules: a line belongs to `KEY` when
//! it starts with `KEY=`, and everything after the first `=` is the value.
//! Writes preserve line order and every byte of the lines they do not own.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum EnvFileError {
    #[error("Env file not found: {path}")]
    Missing { path: String },

    #[error("Invalid key '{key}': keys must be non-empty and contain no '=' or line breaks")]
    InvalidKey { key: String },

    #[error("Invalid value for '{key}': values cannot contain line breaks")]
    InvalidValue { key: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// What an upsert did to the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Replaced,
    Appended,
}

#[derive(Debug, Clone)]
pub struct EnvFile {
    path: PathBuf,
}

impl EnvFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Returns the value of the first `KEY=` line, verbatim.
    pub fn get(&self, key: &str) -> Result<Option<String>, EnvFileError> {
        validate_key(key)?;
        let content = self.read()?;
        Ok(lookup(&content, key).map(str::to_string))
    }

    /// Sets `key` to `value`, replacing the existing line in place or
    /// appending a new one. The file must already exist.
    #[instrument(skip(self, value), fields(path = %self.path.display()))]
    pub fn upsert(&self, key: &str, value: &str) -> Result<Upsert, EnvFileError> {
        validate_key(key)?;
        if value.contains('\n') || value.contains('\r') {
            return Err(EnvFileError::InvalidValue {
                key: key.to_string(),
            });
        }

        let content = self.read()?;
        let (updated, outcome) = apply_upsert(&content, key, value);
        self.write(&updated)?;

        debug!(?outcome, "upserted env key");
        Ok(outcome)
    }

    fn read(&self) -> Result<String, EnvFileError> {
        if !self.path.exists() {
            return Err(EnvFileError::Missing {
                path: self.path.display().to_string(),
            });
        }
        fs::read_to_string(&self.path).map_err(|source| self.io_error(source))
    }

    /// Replaces the file the path resolves to, so a symlinked `.env` stays a
    /// link and the existing permissions carry over to the new content.
    fn write(&self, content: &str) -> Result<(), EnvFileError> {
        let target = fs::canonicalize(&self.path).map_err(|source| self.io_error(source))?;
        let permissions = fs::metadata(&target)
            .map_err(|source| self.io_error(source))?
            .permissions();
        let dir = target.parent().unwrap_or_else(|| Path::new("."));

        let mut staged =
            tempfile::NamedTempFile::new_in(dir).map_err(|source| self.io_error(source))?;
        staged
            .write_all(content.as_bytes())
            .map_err(|source| self.io_error(source))?;
        staged
            .as_file()
            .set_permissions(permissions)
            .map_err(|source| self.io_error(source))?;
        staged
            .persist(&target)
            .map_err(|err| self.io_error(err.error))?;
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> EnvFileError {
        EnvFileError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

pub fn upsert_key<P: AsRef<Path>>(path: P, key: &str, value: &str) -> Result<Upsert, EnvFileError> {
    EnvFile::new(path.as_ref()).upsert(key, value)
}

pub fn read_key<P: AsRef<Path>>(path: P, key: &str) -> Result<Option<String>, EnvFileError> {
    EnvFile::new(path.as_ref()).get(key)
}

fn validate_key(key: &str) -> Result<(), EnvFileError> {
    if key.is_empty() || key.contains('=') || key.contains('\n') || key.contains('\r') {
        return Err(EnvFileError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

fn split_terminator(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

fn lookup<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    let prefix = format!("{}=", key);
    content
        .split_inclusive('\n')
        .map(|line| split_terminator(line).0)
        .find_map(|body| body.strip_prefix(prefix.as_str()))
}

/// Pure upsert over file content. The first `KEY=` line is rewritten and any
/// later duplicates of it are dropped so the key ends up unique.
pub fn apply_upsert(content: &str, key: &str, value: &str) -> (String, Upsert) {
    let prefix = format!("{}=", key);
    let replacement = format!("{}={}", key, value);

    let mut out = String::with_capacity(content.len() + replacement.len() + 1);
    let mut replaced = false;
    let mut newline = "\n";

    for line in content.split_inclusive('\n') {
        let (body, terminator) = split_terminator(line);
        if terminator == "\r\n" {
            newline = "\r\n";
        }

        if body.starts_with(prefix.as_str()) {
            if replaced {
                continue;
            }
            out.push_str(&replacement);
            out.push_str(terminator);
            replaced = true;
        } else {
            out.push_str(line);
        }
    }

    if replaced {
        return (out, Upsert::Replaced);
    }

    if !out.is_empty() && !out.ends_with('\n') {
        out.push_str(newline);
    }
    out.push_str(&replacement);
    out.push_str(newline);
    (out, Upsert::Appended)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_existing_key_when_apply_upsert_then_line_replaced_in_place() {
        let content = "A=1\nWEBHOOK_URL=old\nB=2\n";
        let (updated, outcome) = apply_upsert(content, "WEBHOOK_URL", "https://x.trycloudflare.com");

        assert_eq!(outcome, Upsert::Replaced);
        assert_eq!(updated, "A=1\nWEBHOOK_URL=https://x.trycloudflare.com\nB=2\n");
    }

    #[test]
    fn given_missing_key_when_apply_upsert_then_line_appended() {
        let (updated, outcome) = apply_upsert("A=1\nB=2\n", "C", "3");

        assert_eq!(outcome, Upsert::Appended);
        assert_eq!(updated, "A=1\nB=2\nC=3\n");
    }

    #[test]
    fn given_no_trailing_newline_when_appending_then_previous_line_is_terminated() {
        let (updated, _) = apply_upsert("A=1", "B", "2");
        assert_eq!(updated, "A=1\nB=2\n");
    }

    #[test]
    fn given_empty_content_when_apply_upsert_then_single_line() {
        let (updated, outcome) = apply_upsert("", "A", "1");
        assert_eq!(outcome, Upsert::Appended);
        assert_eq!(updated, "A=1\n");
    }

    #[test]
    fn given_key_prefix_of_other_key_when_apply_upsert_then_other_key_untouched() {
        let content = "BASE_URL_OLD=keep\nBASE_URL=x\n";
        let (updated, _) = apply_upsert(content, "BASE_URL", "y");
        assert_eq!(updated, "BASE_URL_OLD=keep\nBASE_URL=y\n");
    }

    #[test]
    fn given_commented_key_when_apply_upsert_then_comment_is_not_matched() {
        let content = "# BASE_URL=commented\n";
        let (updated, outcome) = apply_upsert(content, "BASE_URL", "y");
        assert_eq!(outcome, Upsert::Appended);
        assert_eq!(updated, "# BASE_URL=commented\nBASE_URL=y\n");
    }

    #[test]
    fn given_duplicate_keys_when_apply_upsert_then_only_first_survives() {
        let content = "K=1\nA=a\nK=2\n";
        let (updated, _) = apply_upsert(content, "K", "9");
        assert_eq!(updated, "K=9\nA=a\n");
    }

    #[test]
    fn given_crlf_file_when_apply_upsert_then_terminators_preserved() {
        let (replaced, _) = apply_upsert("A=1\r\nB=2\r\n", "A", "x");
        assert_eq!(replaced, "A=x\r\nB=2\r\n");

        let (appended, _) = apply_upsert("A=1\r\n", "C", "3");
        assert_eq!(appended, "A=1\r\nC=3\r\n");
    }

    #[test]
    fn given_last_line_without_newline_when_replaced_then_still_without_newline() {
        let (updated, _) = apply_upsert("A=1\nB=2", "B", "3");
        assert_eq!(updated, "A=1\nB=3");
    }

    #[test]
    fn given_value_with_equals_when_lookup_then_rest_of_line_returned() {
        assert_eq!(lookup("URL=http://a?b=c\n", "URL"), Some("http://a?b=c"));
        assert_eq!(lookup("URL=\n", "URL"), Some(""));
        assert_eq!(lookup("OTHER=1\n", "URL"), None);
    }

    #[test]
    fn given_invalid_key_when_validated_then_rejected() {
        assert!(matches!(validate_key(""), Err(EnvFileError::InvalidKey { .. })));
        assert!(matches!(validate_key("A=B"), Err(EnvFileError::InvalidKey { .. })));
        assert!(validate_key("API_V1_STR").is_ok());
    }
}
