//! Run the C preprocessor over devicetree sources
//!
//! The devicetree text is injected entirely through forced `-include`s; the
//! nominal compilation unit is an empty scratch file.

use std::{ffi, path, process};

use fs_err as fs;
use log::{debug, warn};

use crate::error::PreprocessError;

const PREPROCESSOR: &str = "gcc";

/// Preprocess `dts_files` (applied in order, later files overlaying earlier
/// ones) against the `isystem` include directories, returning the combined
/// devicetree text
///
/// # Errors
///
/// - Preprocessor missing from the PATH
/// - Preprocessor exiting nonzero; the error carries its status and stderr
pub fn preprocess_dts(
    dts_files: &[path::PathBuf],
    isystem: &[path::PathBuf],
    deps_out: Option<&path::Path>,
) -> Result<String, PreprocessError> {
    let unit = tempfile::Builder::new()
        .prefix("boardgen-unit")
        .suffix(".c")
        .tempfile()?;
    let output = tempfile::Builder::new()
        .prefix("boardgen-dts")
        .suffix(".pre.dts")
        .tempfile()?;

    // Nonexistent include directories are dropped rather than handed to the
    // preprocessor, which would warn on each of them
    let isystem: Vec<&path::PathBuf> = isystem
        .iter()
        .filter(|dir| {
            let exists = dir.is_dir();
            if !exists {
                debug!("skipping missing include directory {}", dir.display());
            }
            exists
        })
        .collect();

    let args = preprocessor_arguments(dts_files, &isystem, output.path(), deps_out, unit.path());
    debug!(
        "running {PREPROCESSOR} {}",
        args.iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    );

    let result = process::Command::new(PREPROCESSOR)
        .args(&args)
        .output()
        .map_err(|source| PreprocessError::Spawn {
            command: PREPROCESSOR.to_owned(),
            source,
        })?;
    let stderr = String::from_utf8_lossy(&result.stderr);
    if !result.status.success() {
        return Err(PreprocessError::Failed {
            status: result.status,
            stderr: stderr.into_owned(),
        });
    }
    for line in stderr.lines() {
        warn!("{PREPROCESSOR}: {line}");
    }

    Ok(fs::read_to_string(output.path())?)
}

/// Preprocessor command line, kept separate from process handling so the
/// construction is testable
fn preprocessor_arguments(
    dts_files: &[path::PathBuf],
    isystem: &[&path::PathBuf],
    output: &path::Path,
    deps_out: Option<&path::Path>,
    unit: &path::Path,
) -> Vec<ffi::OsString> {
    let mut args: Vec<ffi::OsString> = vec![
        "-x".into(),
        "assembler-with-cpp".into(),
        "-nostdinc".into(),
    ];
    for dir in isystem {
        args.push("-isystem".into());
        args.push(dir.into());
    }
    for file in dts_files {
        args.push("-include".into());
        args.push(file.into());
    }
    args.push("-undef".into());
    args.push("-D__DTS__".into());
    args.push("-E".into());
    args.push("-MD".into());
    if let Some(deps) = deps_out {
        args.push("-MF".into());
        args.push(deps.into());
    }
    args.push("-o".into());
    args.push(output.into());
    args.push(unit.into());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn arguments_follow_the_invocation_contract() {
        let dts = vec![PathBuf::from("board.dts"), PathBuf::from("overlay.dts")];
        let include = PathBuf::from("dts/common");
        let isystem = vec![&include];
        let args = preprocessor_arguments(
            &dts,
            &isystem,
            path::Path::new("out.pre.dts"),
            Some(path::Path::new("out.d")),
            path::Path::new("empty.c"),
        );
        let args: Vec<&str> = args.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            [
                "-x",
                "assembler-with-cpp",
                "-nostdinc",
                "-isystem",
                "dts/common",
                "-include",
                "board.dts",
                "-include",
                "overlay.dts",
                "-undef",
                "-D__DTS__",
                "-E",
                "-MD",
                "-MF",
                "out.d",
                "-o",
                "out.pre.dts",
                "empty.c",
            ]
        );
    }

    #[test]
    fn forced_includes_keep_input_order() {
        let dts = vec![
            PathBuf::from("a.dts"),
            PathBuf::from("b.dts"),
            PathBuf::from("c.dts"),
        ];
        let args = preprocessor_arguments(
            &dts,
            &[],
            path::Path::new("out"),
            None,
            path::Path::new("empty.c"),
        );
        let includes: Vec<&str> = args
            .windows(2)
            .filter(|pair| pair[0] == "-include")
            .map(|pair| pair[1].to_str().unwrap())
            .collect();
        assert_eq!(includes, ["a.dts", "b.dts", "c.dts"]);
    }
}
