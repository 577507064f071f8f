//! Integration tests for ocirepack.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

// Path to ocirepack binary under test
const EXE: &str = env!("CARGO_BIN_EXE_ocirepack");

fn work_dir(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "ocirepack-it-{name}-{}",
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&root);
    fs::create_dir_all(&root).unwrap();
    root
}

fn run(args: &[&str], cwd: &Path) -> std::process::Output {
    let output = Command::new(EXE)
        .args(args)
        .current_dir(cwd)
        .env("NO_COLOR", "YES")
        .output()
        .unwrap();
    eprintln!(
        "$ ocirepack {}\nstdout: {}\nstderr: {}",
        args.join(" "),
        std::str::from_utf8(&output.stdout).unwrap(),
        std::str::from_utf8(&output.stderr).unwrap()
    );
    output
}

#[test]
fn test_init_new_unpack_roundtrip() {
    let root = work_dir("init-new-unpack");
    let image = root.join("image");
    let bundle = root.join("bundle");

    let out = run(
        &["init", "--image", image.to_str().unwrap()],
        &root,
    );
    assert!(out.status.success());
    assert!(image.join("oci-layout").is_file());
    assert!(image.join("index.json").is_file());

    let out = run(
        &[
            "new",
            "--image",
            image.to_str().unwrap(),
            "--tag",
            "latest",
        ],
        &root,
    );
    assert!(out.status.success());

    let out = run(
        &[
            "unpack",
            "--image",
            image.to_str().unwrap(),
            "--tag",
            "latest",
            "--bundle",
            bundle.to_str().unwrap(),
        ],
        &root,
    );
    assert!(out.status.success());
    assert!(bundle.join("rootfs").is_dir());
    assert!(bundle.join("umoci.json").is_file());
}

#[test]
fn test_insert_repack_and_stat() {
    let root = work_dir("insert-repack-stat");
    let image = root.join("image");
    let bundle = root.join("bundle");

    assert!(run(&["init", "--image", image.to_str().unwrap()], &root)
        .status
        .success());
    assert!(run(
        &["new", "--image", image.to_str().unwrap(), "--tag", "latest"],
        &root
    )
    .status
    .success());
    assert!(run(
        &[
            "unpack",
            "--image",
            image.to_str().unwrap(),
            "--tag",
            "latest",
            "--bundle",
            bundle.to_str().unwrap(),
        ],
        &root
    )
    .status
    .success());

    // Insert a host file directly into a new layer.
    let payload = root.join("hello.txt");
    fs::write(&payload, b"hello from the host\n").unwrap();
    let out = run(
        &[
            "insert",
            "--image",
            image.to_str().unwrap(),
            "--tag",
            "latest",
            payload.to_str().unwrap(),
            "/greeting.txt",
        ],
        &root,
    );
    assert!(out.status.success());
    let stderr = std::str::from_utf8(&out.stderr).unwrap();
    assert!(stderr.contains("Inserted"));

    // Re-unpack to see the inserted file land in the rootfs.
    let bundle2 = root.join("bundle2");
    assert!(run(
        &[
            "unpack",
            "--image",
            image.to_str().unwrap(),
            "--tag",
            "latest",
            "--bundle",
            bundle2.to_str().unwrap(),
        ],
        &root
    )
    .status
    .success());
    assert_eq!(
        fs::read_to_string(bundle2.join("rootfs/greeting.txt")).unwrap(),
        "hello from the host\n"
    );

    // Modify the first bundle's rootfs directly, then repack it.
    fs::write(bundle.join("rootfs/from_bundle.txt"), b"added in bundle\n").unwrap();
    let out = run(
        &[
            "repack",
            "--image",
            image.to_str().unwrap(),
            "--bundle",
            bundle.to_str().unwrap(),
        ],
        &root,
    );
    assert!(out.status.success());
    let stderr = std::str::from_utf8(&out.stderr).unwrap();
    assert!(stderr.contains("Repacked"));

    // stat should list the layers for the current tag.
    let out = run(
        &["stat", "--image", image.to_str().unwrap(), "--tag", "latest"],
        &root,
    );
    assert!(out.status.success());
    let stdout = std::str::from_utf8(&out.stdout).unwrap();
    assert!(stdout.contains("manifest:"));
    assert!(stdout.contains("layers:"));
}

#[test]
fn test_config_edits_are_applied() {
    let root = work_dir("config-edits");
    let image = root.join("image");

    assert!(run(&["init", "--image", image.to_str().unwrap()], &root)
        .status
        .success());
    assert!(run(
        &["new", "--image", image.to_str().unwrap(), "--tag", "latest"],
        &root
    )
    .status
    .success());

    let out = run(
        &[
            "config",
            "--image",
            image.to_str().unwrap(),
            "--tag",
            "latest",
            "--entrypoint",
            "/bin/sh",
            "--entrypoint",
            "-c",
            "--env",
            "FOO=bar",
            "--label",
            "com.example.name=ocirepack-test",
        ],
        &root,
    );
    assert!(out.status.success());
    let stderr = std::str::from_utf8(&out.stderr).unwrap();
    assert!(stderr.contains("Reconfigured"));
}

#[test]
fn test_tag_points_at_same_manifest() {
    let root = work_dir("tag");
    let image = root.join("image");

    assert!(run(&["init", "--image", image.to_str().unwrap()], &root)
        .status
        .success());
    assert!(run(
        &["new", "--image", image.to_str().unwrap(), "--tag", "v1"],
        &root
    )
    .status
    .success());
    let out = run(
        &[
            "tag",
            "--image",
            image.to_str().unwrap(),
            "--from",
            "v1",
            "--to",
            "v2",
        ],
        &root,
    );
    assert!(out.status.success());

    // Both tags must resolve and stat successfully, independently.
    for tag in ["v1", "v2"] {
        let out = run(
            &["stat", "--image", image.to_str().unwrap(), "--tag", tag],
            &root,
        );
        assert!(out.status.success());
    }
}

#[test]
fn test_gc_reports_no_stale_scratch_dirs_when_clean() {
    let root = work_dir("gc");
    let image = root.join("image");

    assert!(run(&["init", "--image", image.to_str().unwrap()], &root)
        .status
        .success());
    let out = run(&["gc", "--image", image.to_str().unwrap()], &root);
    assert!(out.status.success());
    let stderr = std::str::from_utf8(&out.stderr).unwrap();
    assert!(stderr.contains("Collected"));
}

#[test]
fn test_unpack_rejects_unknown_tag() {
    let root = work_dir("unknown-tag");
    let image = root.join("image");
    let bundle = root.join("bundle");

    assert!(run(&["init", "--image", image.to_str().unwrap()], &root)
        .status
        .success());
    let out = run(
        &[
            "unpack",
            "--image",
            image.to_str().unwrap(),
            "--tag",
            "does-not-exist",
            "--bundle",
            bundle.to_str().unwrap(),
        ],
        &root,
    );
    assert!(!out.status.success());
}

#[test]
fn test_repack_without_unpack_fails() {
    let root = work_dir("repack-without-unpack");
    let image = root.join("image");
    let bundle = root.join("bundle-never-unpacked");
    fs::create_dir_all(&bundle).unwrap();

    assert!(run(&["init", "--image", image.to_str().unwrap()], &root)
        .status
        .success());
    let out = run(
        &[
            "repack",
            "--image",
            image.to_str().unwrap(),
            "--bundle",
            bundle.to_str().unwrap(),
        ],
        &root,
    );
    assert!(!out.status.success());
    let stderr = std::str::from_utf8(&out.stderr).unwrap();
    assert!(stderr.contains("umoci.json"));
}
