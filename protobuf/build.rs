fn main() {
    println!("cargo:rerun-if-changed=./workernator.proto");
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());
    }
    tonic_build::compile_protos("./workernator.proto")
        .unwrap_or_else(|err| panic!("Failed to compile protos {:?}", err));
}
