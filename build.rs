fn main() {
    // Enables static linking of the vcruntime library on Windows builds so the
    // agent can be dropped onto endpoints without a redistributable installed
    static_vcruntime::metabuild();
}
