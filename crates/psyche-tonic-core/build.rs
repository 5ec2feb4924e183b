/// Builds the gRPC client and server code for `proto/psyche.proto`.
///
/// Image payload fields are generated as `bytes::Bytes` instead of `Vec<u8>`
/// so that images move between the transport, the queue and the generator
/// without being copied.
///
/// The encoded file descriptor set is written next to the generated code so
/// the server can expose it through gRPC reflection:
///
/// ```rust,ignore
/// pub mod proto {
///     tonic::include_proto!("psyche");
/// }
/// ```
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("psyche_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();

    config
        .bytes([
            ".psyche.Img2ImgRequest.image",
            ".psyche.Img2ImgBatchRequest.image",
            ".psyche.Img2ImgResponse.generated_image",
            ".psyche.Img2ImgBatchResponse.generated_images",
        ])
        .file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/psyche.proto"], &["proto"])
        .unwrap();
}
