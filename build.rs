//! Build script that emits git metadata via vergen.

/// Emit compile-time git metadata so it is available at runtime.
///
/// If `GIT_SHA` is set (e.g. by CI), use that directly. Otherwise try
/// vergen-gitcl, which discovers the SHA from the local `.git` directory.
/// A fallback value is emitted first so builds from a bare source tree
/// (no `.git`) still compile.
fn main() {
    let fallback = std::env::var("GIT_SHA").unwrap_or_else(|_| "unknown".to_owned());
    println!("cargo:rustc-env=VERGEN_GIT_SHA={fallback}");
    if std::env::var("GIT_SHA").is_ok() {
        return;
    }

    let _ = (|| -> Result<(), Box<dyn std::error::Error>> {
        use vergen_gitcl::{Emitter, GitclBuilder};
        let gitcl = GitclBuilder::default().sha(true).build()?;
        Emitter::default().add_instructions(&gitcl)?.emit()?;
        Ok(())
    })();
}
