use std::path::Path;

fn main() {
	println!("cargo:rerun-if-changed=linker.ld");
	// Hosted builds (unit tests, tooling) link normally.
	if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("none") {
		return;
	}
	let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
	println!("cargo:rustc-link-search=native={}", manifest_dir.display());
	println!("cargo:rustc-link-arg-bin=stratum=-Tlinker.ld");
}
