fn main() {
    prost_build::compile_protos(&["proto/records.proto"], &["proto"])
        .expect("failed to compile records.proto");
}
