use std::{fmt, io, process};

use thiserror::Error;

/// Error that happened while parsing a task or board descriptor
#[derive(Error, Debug)]
pub enum JsonParseError {
    #[error("could not read descriptor")]
    Io(#[from] io::Error),
    #[error("could not parse JSON")]
    Json(#[from] json::Error),
    #[error("field not found: {0}")]
    FieldNotFound(String),
    #[error("expected JSON object, found {0}")]
    ExpectedObject(String),
    #[error("expected JSON array, found {0}")]
    ExpectedArray(String),
    #[error("expected string for field {field:?}, found {found}")]
    ExpectedString { field: String, found: String },
    #[error("unknown option type {0:?}, expected \"bool\" or \"int\"")]
    UnknownOptionType(String),
}

impl JsonParseError {
    /// Convert into a file-level error, adding the source file name
    pub(crate) fn with_fname(self, fname: String) -> DescriptorFileError {
        DescriptorFileError { fname, err: self }
    }
}

#[derive(Error, Debug)]
#[error("descriptor parse error --> {fname}: {err}")]
pub struct DescriptorFileError {
    fname: String,
    err: JsonParseError,
}

/// Error that happened while resolving a board descriptor against the loaded
/// task descriptors
#[derive(Error, Debug)]
pub enum BoardError {
    #[error("no task descriptor named {0:?}")]
    UnknownTask(String),
    #[error("task {task:?} does not declare start option {option:?}")]
    UnknownOption { task: String, option: String },
    #[error("task {task:?} has no start command")]
    MissingStartCommand { task: String },
    #[error("option {option:?} of task {task:?} has a non-integer value: {value}")]
    InvalidOptionValue {
        task: String,
        option: String,
        value: String,
    },
    #[error("cannot find task {parent:?} to inherit from (referenced by {task:?})")]
    UnknownParent { task: String, parent: String },
}

/// A line:column pair in a devicetree source, indexed from 1:1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Error that happened while parsing preprocessed devicetree source
#[derive(Error, Debug)]
pub enum DtsParseError {
    #[error("{0}: unexpected end of input")]
    UnexpectedEof(Position),
    #[error("{pos}: expected {expected}, found {found:?}")]
    Expected {
        pos: Position,
        expected: &'static str,
        found: char,
    },
    #[error("{pos}: unsupported construct {construct}")]
    Unsupported { pos: Position, construct: String },
    #[error("{pos}: invalid integer literal {literal:?}")]
    InvalidInt { pos: Position, literal: String },
    #[error("{0}: division by zero in constant expression")]
    DivisionByZero(Position),
    #[error("no node is labeled {0:?}")]
    UnknownLabel(String),
    #[error("no node at path {0:?}")]
    UnknownPath(String),
}

/// Error that happened while running the external C preprocessor
#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("could not run preprocessor {command:?}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("preprocessor failed with {status}\n{stderr}")]
    Failed {
        status: process::ExitStatus,
        stderr: String,
    },
    #[error("could not access preprocessor scratch file")]
    Io(#[from] io::Error),
}

/// Error that happened while extracting SPI topology from the devicetree
#[derive(Error, Debug)]
pub enum SpiError {
    #[error("first enumerated node {node} has no string version property")]
    MissingVersion { node: String },
    #[error("spi bus {bus} has no label to name it by")]
    UnlabeledBus { bus: String },
    #[error("bus {bus} is missing required property {property:?}")]
    MissingProperty { bus: String, property: String },
    #[error("node {node} has an invalid unit address")]
    InvalidUnitAddress { node: String },
    #[error(
        "device {device}: chip select index {index} is out of range of the \
         {len}-entry cs-gpios list"
    )]
    ChipSelectIndex {
        device: String,
        index: usize,
        len: usize,
    },
    #[error("gpio controller {controller} does not declare #gpio-cells")]
    MissingGpioCells { controller: String },
    #[error("malformed gpio specifier in {node} property {property:?}")]
    MalformedSpecifier { node: String, property: String },
    #[error("gpio controller {controller} has no label to derive a port name from")]
    UnlabeledController { controller: String },
}
