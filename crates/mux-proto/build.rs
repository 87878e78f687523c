use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var_os("PROTOC").is_none() {
        env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    let config = tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir(&out_dir);

    config.compile_protos(&["proto/control.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/control.proto");

    Ok(())
}
