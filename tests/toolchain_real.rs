//! Scenarios against a real `tectonic` on PATH. Run with `cargo test -- --ignored`.

use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use latex_compiler::{
    application::compile::{CompilationService, HealthStatus},
    infra::{toolchain::CompilerInvoker, workspace::SourceStager},
};

const HEALTH_CHECK: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/assets/health_check.tex");

fn service(dir: &TempDir) -> CompilationService {
    CompilationService::new(
        SourceStager::new(dir.path().join("uploads")).expect("stager"),
        CompilerInvoker::new("tectonic", Duration::from_secs(300)),
        HEALTH_CHECK,
    )
}

#[tokio::test]
#[ignore = "requires tectonic on PATH"]
async fn hello_world_compiles_to_pdf() {
    let dir = TempDir::new().expect("temp dir");
    let service = service(&dir);

    let compiled = service
        .compile_bytes(
            Bytes::from_static(
                b"\\documentclass{article}\n\\begin{document}\nHello, world!\n\\end{document}\n",
            ),
            Some("hello.tex"),
        )
        .await
        .expect("compile");

    assert!(compiled.result.succeeded);
    let pdf = std::fs::read(&compiled.result.artifact_path).expect("read pdf");
    assert!(pdf.starts_with(b"%PDF"));
}

#[tokio::test]
#[ignore = "requires tectonic on PATH"]
async fn undefined_macro_produces_log() {
    let dir = TempDir::new().expect("temp dir");
    let service = service(&dir);

    let compiled = service
        .compile_bytes(
            Bytes::from_static(
                b"\\documentclass{article}\n\\begin{document}\n\\undefinedmacro\n\\end{document}\n",
            ),
            None,
        )
        .await
        .expect("compile ran");

    assert!(!compiled.result.succeeded);
    let log = std::fs::read_to_string(&compiled.result.artifact_path).expect("read log");
    assert!(!log.is_empty());
}

#[tokio::test]
#[ignore = "requires tectonic on PATH"]
async fn bundled_health_check_document_compiles() {
    let dir = TempDir::new().expect("temp dir");
    assert_eq!(service(&dir).check_toolchain().await, HealthStatus::Ok);
}
