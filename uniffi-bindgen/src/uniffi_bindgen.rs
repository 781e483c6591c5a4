//! Generates the Kotlin and Swift bindings for the `securestorage` library.

fn main() {
    uniffi::uniffi_bindgen_main();
}
