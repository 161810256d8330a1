use std::env;
use std::fs;
use std::path::Path;

use itertools::Itertools;

/// `(variant, doc line)` pairs for `engine::error::ErrorKind`.
///
/// Kept as a flat table here, rather than split across call sites,
/// so the generated enum and its docs stay in one place.
const KINDS: &[(&str, &str)] = &[
    ("Ok", "No error; operation completed normally."),
    ("Timeout", "A connect attempt or a write did not complete in time."),
    (
        "GatewayUnavailable",
        "Every candidate edge router in the race failed or timed out.",
    ),
    (
        "ServiceUnavailable",
        "The controller reported no such service, or no session for it.",
    ),
    ("ConnClosed", "The connection is closed; the operation cannot proceed."),
    (
        "InvalidState",
        "The requested operation is not valid for the connection's current state.",
    ),
    ("CryptoFail", "A key-exchange or AEAD primitive failed."),
    ("Wtf", "An internal invariant was violated; this is a bug."),
    ("Controller", "The controller HTTP client reported a transport failure."),
    ("Channel", "The edge-router channel transport reported a failure."),
    ("Communication", "A generic communication failure that does not fit a more specific kind."),
    ("Io", "A plain `std::io::Error` was wrapped without a more specific kind."),
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set by cargo");
    let dest = Path::new(&out_dir).join("error_kind.rs");

    let variants = KINDS
        .iter()
        .map(|(name, doc)| format!("    /// {}\n    {},", doc, name))
        .join("\n");

    let source = format!(
        "/// The kind of error reported by an `engine::error::Error`.\n\
         #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]\n\
         pub enum ErrorKind {{\n{}\n}}\n",
        variants,
    );

    fs::write(&dest, source).expect("failed to write generated ErrorKind");
    println!("cargo:rerun-if-changed=build.rs");
}
