fn main() {
    // Propagate the ESP-IDF build environment to dependent crates when
    // building for the device. Host builds (tests, simulation) skip this.
    let for_device = std::env::var("CARGO_FEATURE_ESPIDF").is_ok()
        && std::env::var("TARGET").is_ok_and(|t| t.contains("espidf"));
    if for_device {
        embuild::espidf::sysenv::output();
    }
}
