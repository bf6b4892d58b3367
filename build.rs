fn main() {
    // Baked into `--version` and the server's initialize reply.
    println!(
        "cargo:rustc-env=BOARDGAME_MCP_VERSION={}",
        env!("CARGO_PKG_VERSION")
    );
    println!("cargo:rerun-if-changed=Cargo.toml");
}
