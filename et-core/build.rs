fn main() {
    prost_build::compile_protos(&["proto/et.proto"], &["proto/"]).expect("compiling et.proto");
}
