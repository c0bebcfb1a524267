//! Exposes functionality supported by this crate
mod error;

use std::{collections::BTreeSet, path};

pub use error::ApiError;

pub use crate::boardcfg::{
    BoardDescriptor, CommandSpec, OptionSpec, OptionType, StartCommand, TaskDescriptor,
    TaskRequest, TaskSet,
};
pub use crate::dts::model::{Cell, Devicetree, Node, NodeId, Piece, Property, RefTarget};
pub use crate::dts::spi::{PinRef, SpiBus, SpiDevice, SpiDocument, SpiVersion};
pub use crate::error::{
    BoardError, DescriptorFileError, DtsParseError, JsonParseError, Position, PreprocessError,
    SpiError,
};

/// Load every `*task.json` descriptor found under `root`
pub fn load_tasks(root: &path::Path) -> Result<TaskSet, ApiError> {
    Ok(TaskSet::load(root)?)
}

/// Load the board descriptor at `path`
pub fn load_board(path: &path::Path) -> Result<BoardDescriptor, ApiError> {
    Ok(crate::boardcfg::load_board(path)?)
}

/// Resolve every task referenced by `board` into `<task> <args> start`
/// command lines, in the board file's declaration order
pub fn resolve_start_commands(
    tasks: &TaskSet,
    board: &BoardDescriptor,
) -> Result<Vec<StartCommand>, ApiError> {
    Ok(crate::boardcfg::resolve_start_commands(tasks, board)?)
}

/// Run the C preprocessor over `dts_files` and return the combined
/// devicetree text
pub fn preprocess_dts(
    dts_files: &[path::PathBuf],
    isystem: &[path::PathBuf],
    deps_out: Option<&path::Path>,
) -> Result<String, ApiError> {
    Ok(crate::dts::preprocess::preprocess_dts(
        dts_files, isystem, deps_out,
    )?)
}

/// Parse preprocessed devicetree source into a merged tree
pub fn parse_devicetree(source: &str) -> Result<Devicetree, ApiError> {
    Ok(crate::dts::parse::parse_dts(source)?)
}

/// Load vendor prefix files into one merged set
pub fn load_vendor_prefixes(paths: &[path::PathBuf]) -> Result<BTreeSet<String>, ApiError> {
    Ok(crate::dts::load_vendor_prefixes(paths)?)
}

/// Check `compatible` vendor prefixes, returning one message per unknown
/// prefix; skipped when `prefixes` is empty
#[must_use]
pub fn check_vendor_prefixes(dt: &Devicetree, prefixes: &BTreeSet<String>) -> Vec<String> {
    crate::dts::check_vendor_prefixes(dt, prefixes)
}

/// Extract the SPI topology document from a parsed devicetree
pub fn extract_spi_topology(dt: &Devicetree) -> Result<SpiDocument, ApiError> {
    Ok(crate::dts::spi::extract_spi_topology(dt)?)
}

/// Render `template` against the extracted topology
pub fn render_template(template: &str, doc: &SpiDocument) -> Result<String, ApiError> {
    Ok(crate::render::render_template(template, doc)?)
}
