fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    #[cfg(feature = "cuda")]
    {
        println!("cargo:rerun-if-changed=../scan_gpu/src");

        cuda_builder::CudaBuilder::new("../scan_gpu")
            .copy_to("../resources/scan_gpu.ptx")
            .build()
            .unwrap();
    }
}
