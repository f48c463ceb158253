fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=MOONLINK_LUAJIT_LUA52COMPAT");

    // Lua 5.2 extensions stay off unless explicitly requested; the bridge
    // only relies on the 5.1 API surface plus luaJIT_setmode.
    let lua52compat = std::env::var("MOONLINK_LUAJIT_LUA52COMPAT")
        .map(|v| v == "1")
        .unwrap_or(false);

    let artifacts = luajit_src::Build::new().lua52compat(lua52compat).build();
    artifacts.print_cargo_metadata();
}
