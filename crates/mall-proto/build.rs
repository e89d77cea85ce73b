fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);

    let out_dir = std::path::PathBuf::from(std::env::var("OUT_DIR")?);

    // Messages also travel as JSON through the edge gateway, so every
    // generated type derives serde and tolerates missing fields.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .type_attribute(".", "#[serde(default)]")
        .file_descriptor_set_path(out_dir.join("descriptor.bin"))
        .compile_protos(
            &[
                "../../proto/mall/v1/types.proto",
                "../../proto/mall/v1/auth.proto",
                "../../proto/mall/v1/user.proto",
                "../../proto/mall/v1/product.proto",
                "../../proto/mall/v1/cart.proto",
                "../../proto/mall/v1/order.proto",
                "../../proto/mall/v1/payment.proto",
                "../../proto/mall/v1/checkout.proto",
            ],
            &["../../proto"],
        )?;
    Ok(())
}
