use std::process::Command;

/// Bindings under `src/gen` are checked in. Set `EXT_PROC_REGENERATE=1` to
/// rebuild them from the Envoy and gRPC health protos.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=EXT_PROC_REGENERATE");
    println!("cargo:rerun-if-changed=build.rs");

    if std::env::var_os("EXT_PROC_REGENERATE").is_none() {
        return Ok(());
    }

    // Download Envoy protos if they don't exist
    if !std::path::Path::new("proto").exists() {
        println!("Downloading Envoy protos...");
        std::fs::create_dir_all("proto")?;
        Command::new("buf")
            .args(["export", "buf.build/envoyproxy/envoy", "-o", "proto"])
            .status()?;
        Command::new("buf")
            .args(["export", "buf.build/grpc/grpc", "-o", "proto"])
            .status()?;
    }

    let protos = [
        "envoy/service/ext_proc/v3/external_processor.proto",
        "envoy/config/core/v3/base.proto",
        "envoy/extensions/filters/http/ext_proc/v3/processing_mode.proto",
        "envoy/type/v3/http_status.proto",
        "grpc/health/v1/health.proto",
    ];

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir("src/gen")
        .compile(
            &protos
                .iter()
                .map(|p| format!("proto/{}", p))
                .collect::<Vec<_>>(),
            &["proto"],
        )?;

    println!("cargo:rerun-if-changed=proto");

    Ok(())
}
