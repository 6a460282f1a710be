#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::io::SeekFrom;

use common::{mem_dfs, seed_file};
use vfd::{FdConfig, File, FileAccess, OpenFlags, SubXactId};

/// Tiny deterministic generator; keeps the test reproducible without
/// pulling in a randomness crate.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

/// Drive a random mix of operations under a small budget and verify the
/// structural invariants after every single one.
#[test]
fn randomized_operations_preserve_invariants() {
    let dir = tempfile::tempdir().unwrap();
    let config = FdConfig {
        data_dir: dir.path().to_path_buf(),
        temp_dir: dir.path().to_path_buf(),
        ..FdConfig::default()
    };
    let (connector, state) = mem_dfs();
    seed_file(&state, "/seed", b"some remote bytes to read");

    let mut fa = FileAccess::new(config, connector);
    fa.pin_max_safe_fds(4).unwrap();
    fa.set_current_subxact(SubXactId(1));

    let mut rng = Lcg(0x5eed);
    let mut handles: Vec<File> = Vec::new();
    let mut opened = 0u32;

    for step in 0..400 {
        match rng.below(10) {
            // Open a local file.
            0 | 1 => {
                let path = dir.path().join(format!("file-{}", rng.below(8)));
                let f = fa
                    .path_open(
                        path.to_str().unwrap(),
                        OpenFlags::RDWR | OpenFlags::CREAT,
                        0o600,
                    )
                    .unwrap();
                handles.push(f);
                opened += 1;
            }
            // Open a remote reader.
            2 => {
                let f = fa
                    .path_open("hdfs://h:9000/seed", OpenFlags::RDONLY, 0o644)
                    .unwrap();
                handles.push(f);
                opened += 1;
            }
            // Open a temp file in the current scope.
            3 => {
                let f = fa
                    .open_temporary_file("rand", opened, true, true, true, true)
                    .unwrap();
                handles.push(f);
                opened += 1;
            }
            // Write somewhere.
            4 | 5 => {
                if let Some(&f) = handles.get(rng.below(handles.len().max(1) as u64) as usize) {
                    // Remote readers refuse writes; that is fine, the
                    // invariants must hold either way.
                    let _ = fa.file_write(f, b"payload");
                }
            }
            // Read somewhere.
            6 => {
                if let Some(&f) = handles.get(rng.below(handles.len().max(1) as u64) as usize) {
                    let mut buf = [0u8; 8];
                    let _ = fa.file_read(f, &mut buf);
                }
            }
            // Seek somewhere.
            7 => {
                if let Some(&f) = handles.get(rng.below(handles.len().max(1) as u64) as usize) {
                    let _ = fa.file_seek(f, SeekFrom::Start(rng.below(32)));
                }
            }
            // Close one handle.
            8 => {
                if !handles.is_empty() {
                    let i = rng.below(handles.len() as u64) as usize;
                    let f = handles.swap_remove(i);
                    fa.file_close(f).unwrap();
                }
            }
            // Drop every kernel descriptor at once.
            _ => {
                fa.close_all_vfds().unwrap();
            }
        }

        fa.check_invariants();
        assert!(
            fa.open_file_count() <= 4,
            "budget violated at step {step}"
        );
    }

    // End the transaction: every temp handle closes, the rest survive
    // only if untagged — and this run tagged only temp files.
    fa.at_eoxact();
    fa.check_invariants();
    fa.at_proc_exit();
    fa.check_invariants();
}
