use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

const MAIN: &str = "void mainImage(out vec4 c, in vec2 p) { c = vec4(p / iResolution.xy, 0.0, 1.0); }";

fn write_shader(dir: &Path, file: &str, passes: &str) -> PathBuf {
    let path = dir.join(file);
    fs::write(
        &path,
        format!(r#"{{ "Shader": {{ "info": {{ "name": "Demo" }}, "renderpass": [ {passes} ] }} }}"#),
    )
    .unwrap();
    path
}

fn toyview(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_toyview"))
        .env_remove("SHADERTOY_API_KEY")
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("failed to run toyview")
}

#[test]
fn check_reports_passes_and_edges() {
    let root = TempDir::new().unwrap();
    let shader = write_shader(
        root.path(),
        "demo.json",
        &format!(
            r#"{{ "name": "Buffer A", "type": "buffer", "code": "{MAIN}", "inputs": [], "outputs": [ {{ "id": 257 }} ] }},
               {{ "name": "Image", "type": "image", "code": "{MAIN}",
                  "inputs": [ {{ "id": 257, "channel": 0, "ctype": "buffer" }} ], "outputs": [ {{ "id": 37 }} ] }}"#
        ),
    );

    let output = toyview(&["check", shader.to_str().unwrap()]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("Demo: 2 pass(es), 1 edge(s)"), "{stdout}");
    assert!(stdout.contains("Buffer A -> Image"), "{stdout}");
    assert!(stdout.contains("[presents]"), "{stdout}");
    assert!(stdout.contains("pipeline layouts and targets need a GPU"), "{stdout}");
}

#[test]
fn check_rejects_keyboard_input() {
    let root = TempDir::new().unwrap();
    let shader = write_shader(
        root.path(),
        "keys.json",
        &format!(
            r#"{{ "name": "Image", "type": "image", "code": "{MAIN}",
                  "inputs": [ {{ "id": 33, "channel": 0, "ctype": "keyboard" }} ], "outputs": [ {{ "id": 37 }} ] }}"#
        ),
    );

    let output = toyview(&["check", shader.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("keyboard"));
}

#[test]
fn check_reports_compile_errors() {
    let root = TempDir::new().unwrap();
    let shader = write_shader(
        root.path(),
        "broken.json",
        r#"{ "name": "Image", "type": "image", "code": "void mainImage(out vec4 c, in vec2 p) { c = nope; }",
             "inputs": [], "outputs": [ { "id": 37 } ] }"#,
    );

    let output = toyview(&["check", shader.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Image"));
}

#[test]
fn check_fails_for_missing_file() {
    let root = TempDir::new().unwrap();
    let missing = root.path().join("absent.json");
    let output = toyview(&["check", missing.to_str().unwrap()]);
    assert!(!output.status.success());
}

#[test]
fn remote_shader_without_key_fails() {
    let output = toyview(&["check", "shadertoy://XsXXDn"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("API key"));
}

#[test]
fn invalid_config_is_rejected() {
    let root = TempDir::new().unwrap();
    let config = root.path().join("toyview.toml");
    fs::write(&config, "version = 7\n").unwrap();
    let shader = write_shader(
        root.path(),
        "demo.json",
        &format!(
            r#"{{ "name": "Image", "type": "image", "code": "{MAIN}", "inputs": [], "outputs": [ {{ "id": 37 }} ] }}"#
        ),
    );

    let output = toyview(&[
        "--config",
        config.to_str().unwrap(),
        "check",
        shader.to_str().unwrap(),
    ]);
    assert!(!output.status.success());
}
