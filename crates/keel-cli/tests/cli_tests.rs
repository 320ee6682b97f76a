//! Integration tests for the keel CLI.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Test context with an isolated keel home and project directory
struct TestContext {
    temp_dir: TempDir,
    keel_home: PathBuf,
    project: PathBuf,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let keel_home = temp_dir.path().join(".keel");
        let project = temp_dir.path().join("project");
        std::fs::create_dir_all(&keel_home).expect("failed to create keel home");
        std::fs::create_dir_all(&project).expect("failed to create project dir");
        Self {
            temp_dir,
            keel_home,
            project,
        }
    }

    fn keel_cmd(&self) -> Command {
        let bin_path = env!("CARGO_BIN_EXE_keel");
        let mut cmd = Command::new(bin_path);
        cmd.env("HOME", self.temp_dir.path());
        cmd.env("KEEL_HOME", &self.keel_home);
        cmd.env_remove("KEEL_CACHE_DIR");
        cmd.current_dir(&self.project);
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.keel_cmd().args(args).output().expect("failed to run keel")
    }

    fn write_manifest(&self, content: &str) -> PathBuf {
        let path = self.project.join("keel.toml");
        std::fs::write(&path, content).expect("failed to write manifest");
        path
    }
}

fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

/// Serve one module `org.example:lib` 1.0 with a single jar.
fn serve_lib(server: &mut mockito::ServerGuard, jar: &[u8]) -> Vec<mockito::Mock> {
    serve_lib_with(server, jar, jar)
}

/// Like [`serve_lib`], but the descriptor digest is computed over `published`
/// while `served` is what the jar URL returns.
fn serve_lib_with(
    server: &mut mockito::ServerGuard,
    published: &[u8],
    served: &[u8],
) -> Vec<mockito::Mock> {
    let descriptor = format!(
        r#"{{"group":"org.example","name":"lib","version":"1.0","artifacts":[{{"extension":"jar","digest":"sha256:{}","size":{}}}]}}"#,
        sha256_hex(published),
        published.len()
    );
    vec![
        server
            .mock("GET", "/org/example/lib/versions.json")
            .with_status(200)
            .with_body(r#"{"versions":["0.9","1.0"]}"#)
            .create(),
        server
            .mock("GET", "/org/example/lib/1.0/descriptor.json")
            .with_status(200)
            .with_body(descriptor)
            .create(),
        server
            .mock("GET", "/org/example/lib/1.0/descriptor.json.sha256")
            .with_status(404)
            .create(),
        server
            .mock("GET", "/org/example/lib/1.0/lib-1.0.jar")
            .with_status(200)
            .with_body(served)
            .expect(1)
            .create(),
    ]
}

fn manifest_for(url: &str) -> String {
    format!(
        r#"
[project]
name = "demo"

[dependencies]
"org.example:lib" = "[1.0,2.0)"

[[repositories]]
name = "mock"
url = "{url}"
"#
    )
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_help_command() {
    let ctx = TestContext::new();
    let output = ctx.run(&["--help"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Usage:"));
}

#[test]
fn test_version_command() {
    let ctx = TestContext::new();
    let output = ctx.run(&["--version"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_cache_path_honors_keel_home() {
    let ctx = TestContext::new();
    let output = ctx.run(&["cache", "path"]);
    assert!(output.status.success());
    assert_eq!(
        stdout(&output).trim(),
        ctx.keel_home.join("cache").display().to_string()
    );
}

#[test]
fn test_cache_dir_flag_overrides_default() {
    let ctx = TestContext::new();
    let custom = ctx.temp_dir.path().join("elsewhere");
    let output = ctx.run(&["cache", "path", "--cache-dir", &custom.display().to_string()]);
    assert!(output.status.success());
    assert_eq!(stdout(&output).trim(), custom.display().to_string());
}

#[test]
fn test_completions_generate() {
    let ctx = TestContext::new();
    let output = ctx.run(&["completions", "bash"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("keel"));
}

#[test]
fn test_missing_manifest_fails() {
    let ctx = TestContext::new();
    let output = ctx.run(&["resolve"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("keel.toml"));
}

#[test]
fn test_empty_cache_verifies_clean() {
    let ctx = TestContext::new();
    let output = ctx.run(&["cache", "verify"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("0 artifacts checked"));

    let output = ctx.run(&["cache", "clean"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("Removed 0 temporary files"));
}

#[test]
fn test_resolve_json_and_lockfile() {
    let ctx = TestContext::new();
    let mut server = mockito::Server::new();
    let jar = b"lib-1.0-content";
    let mocks = serve_lib(&mut server, jar);
    ctx.write_manifest(&manifest_for(&server.url()));

    let output = ctx.run(&["resolve", "--json", "--write-lock"]);
    assert!(output.status.success(), "{}", stderr(&output));

    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("valid JSON");
    let components = json["components"].as_array().expect("component list");
    assert_eq!(components.len(), 1);
    assert_eq!(components[0]["coordinate"]["name"], "lib");
    assert_eq!(components[0]["version"], "1.0");

    let path = components[0]["artifacts"][0]["path"]
        .as_str()
        .expect("artifact path");
    assert!(Path::new(path).starts_with(ctx.keel_home.join("cache")));
    assert_eq!(std::fs::read(path).expect("cached artifact"), jar);

    let lock = std::fs::read_to_string(ctx.project.join("keel.lock")).expect("lockfile written");
    assert!(lock.contains("name = \"lib\""));
    assert!(lock.contains("version = \"1.0\""));

    // Second run is served from the cache; the jar mock expects one hit
    let output = ctx.run(&["resolve", "--locked", "--quiet"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("org.example:lib"));
    mocks[3].assert();
}

#[test]
fn test_offline_resolve_uses_cache_only() {
    let ctx = TestContext::new();
    let mut server = mockito::Server::new();
    let _mocks = serve_lib(&mut server, b"jar");
    ctx.write_manifest(&manifest_for(&server.url()));

    let output = ctx.run(&["resolve", "--quiet"]);
    assert!(output.status.success(), "{}", stderr(&output));

    drop(server);
    let output = ctx.run(&["resolve", "--offline", "--quiet"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("1.0"));
}

#[test]
fn test_why_explains_root_requirement() {
    let ctx = TestContext::new();
    let mut server = mockito::Server::new();
    let _mocks = serve_lib(&mut server, b"jar");
    ctx.write_manifest(&manifest_for(&server.url()));

    let output = ctx.run(&["why", "org.example:lib"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("org.example:lib 1.0"));
    assert!(text.contains("root requires"));

    let output = ctx.run(&["why", "org.example:other"]);
    assert!(!output.status.success());
}

#[test]
fn test_corrupt_download_fails_resolution() {
    let ctx = TestContext::new();
    let mut server = mockito::Server::new();
    // Same length, different bytes
    let _mocks = serve_lib_with(&mut server, b"expected", b"tampered");
    ctx.write_manifest(&manifest_for(&server.url()));

    let output = ctx.run(&["resolve", "--quiet"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Integrity check failed"));
    assert!(!ctx.keel_home.join("cache/modules/org.example/lib/1.0/lib-1.0.jar").exists());
}
