fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_prost_build::configure().compile_protos(&["proto/failover.proto"], &["proto"])?;

    // Tell cargo to rerun if the proto file changes
    println!("cargo:rerun-if-changed=proto/failover.proto");

    Ok(())
}
