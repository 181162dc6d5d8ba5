fn main() {
    // Build metadata for the version output.  Metadata might not be available when compiling
    // from a published crate, so don't fail the build over it.
    if let Err(e) = vergen::EmitBuilder::builder().all_cargo().emit() {
        println!("cargo:warning=failed to emit build metadata: {e}");
    }
}
