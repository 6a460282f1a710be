#![allow(clippy::unwrap_used, missing_docs)]

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use vfd::{FdConfig, FileAccess, SubXactId};

fn test_config(dir: &Path) -> FdConfig {
    FdConfig {
        data_dir: dir.to_path_buf(),
        temp_dir: dir.to_path_buf(),
        ..FdConfig::default()
    }
}

/// Every file under `<root>/pgsql_tmp` carrying the temp prefix.
fn temp_files(root: &Path) -> Vec<PathBuf> {
    let tmpdir = root.join("pgsql_tmp");
    let Ok(entries) = std::fs::read_dir(&tmpdir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("pgsql_tmp"))
        .map(|e| e.path())
        .collect()
}

#[test]
fn subtransaction_abort_removes_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut fa = FileAccess::local_only(test_config(dir.path()));
    fa.set_current_subxact(SubXactId(2));

    let f = fa
        .open_temporary_file("sort", 0, true, true, true, true)
        .unwrap();
    assert_eq!(fa.file_write(f, b"xyz").unwrap(), 3);
    assert_eq!(fa.open_file_count(), 1);
    assert_eq!(temp_files(dir.path()).len(), 1);
    fa.check_invariants();

    fa.at_eosubxact(false, SubXactId(2), SubXactId(1));
    fa.check_invariants();

    assert_eq!(temp_files(dir.path()).len(), 0, "abort must unlink the file");
    assert_eq!(fa.open_file_count(), 0, "abort must release the kernel fd");
}

#[test]
fn subtransaction_commit_reassigns_to_parent() {
    let dir = tempfile::tempdir().unwrap();
    let mut fa = FileAccess::local_only(test_config(dir.path()));
    fa.set_current_subxact(SubXactId(2));

    let f = fa
        .open_temporary_file("sort", 0, true, true, true, true)
        .unwrap();
    fa.file_write(f, b"kept").unwrap();

    // Commit of the inner scope: the handle survives, now owned by the
    // parent.
    fa.at_eosubxact(true, SubXactId(2), SubXactId(1));
    fa.check_invariants();
    assert_eq!(temp_files(dir.path()).len(), 1);
    fa.file_write(f, b" going").unwrap();

    // Ending the parent scope closes (and, being temporary, unlinks) it.
    fa.at_eosubxact(false, SubXactId(1), SubXactId(0));
    assert_eq!(temp_files(dir.path()).len(), 0);
}

#[test]
fn transaction_end_hooks_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut fa = FileAccess::local_only(test_config(dir.path()));
    fa.set_current_subxact(SubXactId(1));

    fa.open_temporary_file("spill", 0, true, true, true, true)
        .unwrap();
    fa.open_temporary_file("hash", 1, true, true, true, true)
        .unwrap();
    assert_eq!(temp_files(dir.path()).len(), 2);

    fa.at_eoxact();
    fa.check_invariants();
    assert_eq!(temp_files(dir.path()).len(), 0);

    // Calling the hook again with nothing open changes nothing.
    fa.at_eoxact();
    fa.check_invariants();

    // Process exit after transaction end leaves no temp files either.
    fa.at_proc_exit();
    assert_eq!(temp_files(dir.path()).len(), 0);
}

#[test]
fn proc_exit_sweeps_cross_transaction_temporaries() {
    let dir = tempfile::tempdir().unwrap();
    let mut fa = FileAccess::local_only(test_config(dir.path()));

    // del_on_close without close_at_eoxact: survives transaction end,
    // removed at process exit.
    let f = fa
        .open_temporary_file("interxact", 0, false, true, true, false)
        .unwrap();
    fa.file_write(f, b"spill").unwrap();

    fa.at_eoxact();
    assert_eq!(temp_files(dir.path()).len(), 1);
    fa.check_invariants();

    fa.at_proc_exit();
    assert_eq!(temp_files(dir.path()).len(), 0);
}

#[test]
fn dropping_the_context_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut fa = FileAccess::local_only(test_config(dir.path()));
        fa.open_temporary_file("sort", 0, true, true, true, true)
            .unwrap();
        assert_eq!(temp_files(dir.path()).len(), 1);
    }
    assert_eq!(temp_files(dir.path()).len(), 0);
}

#[test]
fn shared_temp_names_are_predictable() {
    let dir = tempfile::tempdir().unwrap();
    let mut fa = FileAccess::local_only(test_config(dir.path()));

    let writer = fa
        .open_temporary_file("workfile", 7, false, true, false, false)
        .unwrap();
    fa.file_write(writer, b"shared").unwrap();
    fa.file_close(writer).unwrap();

    let expected = dir.path().join("pgsql_tmp").join("pgsql_tmp_workfile.0007");
    assert!(expected.exists());

    // A second open under the same (label, extent) finds the same file.
    let reader = fa
        .open_temporary_file("workfile", 7, false, false, false, false)
        .unwrap();
    let mut buf = [0u8; 6];
    fa.file_seek(reader, SeekFrom::Start(0)).unwrap();
    fa.file_read(reader, &mut buf).unwrap();
    assert_eq!(&buf, b"shared");
    fa.file_unlink(reader).unwrap();
    assert!(!expected.exists());
}

#[test]
fn opening_a_missing_shared_temp_file_fails_softly() {
    let dir = tempfile::tempdir().unwrap();
    let mut fa = FileAccess::local_only(test_config(dir.path()));

    assert!(
        fa.open_temporary_file("absent", 0, false, false, false, false)
            .is_err()
    );
    fa.check_invariants();
}

#[test]
fn unique_names_do_not_collide() {
    let dir = tempfile::tempdir().unwrap();
    let mut fa = FileAccess::local_only(test_config(dir.path()));

    let first = fa
        .open_temporary_file("sort", 0, true, true, true, false)
        .unwrap();
    let second = fa
        .open_temporary_file("sort", 0, true, true, true, false)
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(temp_files(dir.path()).len(), 2);

    fa.file_close(first).unwrap();
    fa.file_close(second).unwrap();
    assert_eq!(temp_files(dir.path()).len(), 0);
}

#[test]
fn orphan_sweep_removes_only_prefixed_files() {
    let dir = tempfile::tempdir().unwrap();

    // Pre-populate the temp-root pgsql_tmp as a crashed predecessor
    // would have left it.
    let tmpdir = dir.path().join("pgsql_tmp");
    std::fs::create_dir_all(&tmpdir).unwrap();
    std::fs::write(tmpdir.join("pgsql_tmp_A"), b"orphan").unwrap();
    std::fs::write(tmpdir.join("pgsql_tmp_B"), b"orphan").unwrap();
    std::fs::write(tmpdir.join("README"), b"hands off").unwrap();

    // And one per-database temp dir under base/.
    let db_tmp = dir.path().join("base").join("16384").join("pgsql_tmp");
    std::fs::create_dir_all(&db_tmp).unwrap();
    std::fs::write(db_tmp.join("pgsql_tmp_sort_99_0000.3"), b"orphan").unwrap();
    std::fs::write(db_tmp.join("notes.txt"), b"hands off").unwrap();

    let fa = FileAccess::local_only(test_config(dir.path()));
    fa.remove_pg_temp_files();

    assert!(!tmpdir.join("pgsql_tmp_A").exists());
    assert!(!tmpdir.join("pgsql_tmp_B").exists());
    assert!(tmpdir.join("README").exists());
    assert!(!db_tmp.join("pgsql_tmp_sort_99_0000.3").exists());
    assert!(db_tmp.join("notes.txt").exists());
}

#[test]
fn orphaned_name_is_reused_without_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut fa = FileAccess::local_only(test_config(dir.path()));

    // Simulate an orphan occupying the exact name the next unique temp
    // file will get (counter starts at zero, extent zero).
    let tmpdir = dir.path().join("pgsql_tmp");
    std::fs::create_dir_all(&tmpdir).unwrap();
    let orphan = tmpdir.join(format!("pgsql_tmp_sort_{}_0000.0", std::process::id()));
    std::fs::write(&orphan, b"stale contents").unwrap();

    // No O_EXCL: the orphan is opened and truncated, not an error.
    let f = fa
        .open_temporary_file("sort", 0, true, true, true, false)
        .unwrap();
    assert_eq!(fa.file_seek(f, SeekFrom::End(0)).unwrap(), 0);
    fa.file_close(f).unwrap();
}
