use env_file::{read_key, upsert_key, EnvFile, EnvFileError, Upsert};
use std::fs;
use tempfile::TempDir;

fn write_env(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(".env");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn given_existing_key_when_upsert_then_exactly_one_line_has_new_value() {
    let dir = TempDir::new().unwrap();
    let original = "DATABASE_URL=sqlite:///./zeipo.db\nWEBHOOK_URL=https://old.trycloudflare.com\nAT_USER=sandbox\n";
    let path = write_env(&dir, original);

    let outcome = upsert_key(&path, "WEBHOOK_URL", "https://new.trycloudflare.com").unwrap();
    assert_eq!(outcome, Upsert::Replaced);

    let after = fs::read_to_string(&path).unwrap();
    let matching: Vec<&str> = after
        .lines()
        .filter(|l| l.starts_with("WEBHOOK_URL="))
        .collect();
    assert_eq!(matching, vec!["WEBHOOK_URL=https://new.trycloudflare.com"]);

    let before_lines: Vec<&str> = original.lines().collect();
    let after_lines: Vec<&str> = after.lines().collect();
    assert_eq!(before_lines.len(), after_lines.len());
    for (before, after) in before_lines.iter().zip(after_lines.iter()) {
        if !before.starts_with("WEBHOOK_URL=") {
            assert_eq!(before, after);
        }
    }
}

#[test]
fn given_absent_key_when_upsert_then_file_is_original_plus_one_line() {
    let dir = TempDir::new().unwrap();
    let original = "DATABASE_URL=sqlite:///./zeipo.db\nAT_USER=sandbox\n";
    let path = write_env(&dir, original);

    let outcome = upsert_key(&path, "BASE_URL", "https://abc.trycloudflare.com").unwrap();
    assert_eq!(outcome, Upsert::Appended);

    let after = fs::read_to_string(&path).unwrap();
    assert_eq!(
        after,
        format!("{}BASE_URL=https://abc.trycloudflare.com\n", original)
    );
}

#[test]
fn given_missing_file_when_upsert_then_error_and_no_file_created() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".env");

    let err = upsert_key(&path, "A", "1").unwrap_err();
    assert!(matches!(err, EnvFileError::Missing { .. }));
    assert!(!path.exists());
}

#[test]
fn given_repeated_upserts_when_read_back_then_last_value_wins() {
    let dir = TempDir::new().unwrap();
    let path = write_env(&dir, "");
    let env = EnvFile::new(&path);

    env.upsert("DEFAULT_TELEPHONY_PROVIDER", "at").unwrap();
    env.upsert("DEFAULT_TELEPHONY_PROVIDER", "voip_simulator").unwrap();

    assert_eq!(
        env.get("DEFAULT_TELEPHONY_PROVIDER").unwrap().as_deref(),
        Some("voip_simulator")
    );
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "DEFAULT_TELEPHONY_PROVIDER=voip_simulator\n"
    );
}

#[test]
fn given_value_with_newline_when_upsert_then_rejected_without_touching_file() {
    let dir = TempDir::new().unwrap();
    let path = write_env(&dir, "A=1\n");

    let err = upsert_key(&path, "A", "1\nB=2").unwrap_err();
    assert!(matches!(err, EnvFileError::InvalidValue { .. }));
    assert_eq!(fs::read_to_string(&path).unwrap(), "A=1\n");
}

#[test]
fn given_api_prefix_when_read_key_then_value_returned_verbatim() {
    let dir = TempDir::new().unwrap();
    let path = write_env(&dir, "API_V1_STR=api/v2\n");

    assert_eq!(read_key(&path, "API_V1_STR").unwrap().as_deref(), Some("api/v2"));
    assert_eq!(read_key(&path, "MISSING").unwrap(), None);
}

#[cfg(unix)]
#[test]
fn given_symlinked_env_file_when_upsert_then_link_kept_and_target_updated() {
    use std::os::unix::fs::symlink;

    let dir = TempDir::new().unwrap();
    let shared = dir.path().join("shared.env");
    fs::write(&shared, "A=1\n").unwrap();
    let link = dir.path().join(".env");
    symlink(&shared, &link).unwrap();

    upsert_key(&link, "A", "2").unwrap();

    assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_to_string(&shared).unwrap(), "A=2\n");
}

#[cfg(unix)]
#[test]
fn given_world_readable_env_file_when_upsert_then_mode_preserved() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let path = write_env(&dir, "A=1\n");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

    upsert_key(&path, "B", "2").unwrap();

    let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o644);
    assert_eq!(fs::read_to_string(&path).unwrap(), "A=1\nB=2\n");
}
