use std::io;

use thiserror::Error;

use crate::error::{BoardError, DescriptorFileError, DtsParseError, PreprocessError, SpiError};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("could not parse descriptor")]
    Descriptor(#[from] DescriptorFileError),
    #[error("board configuration failed")]
    Board(#[from] BoardError),
    #[error("devicetree preprocessing failed")]
    Preprocess(#[from] PreprocessError),
    #[error("could not parse devicetree")]
    DtsParse(#[from] DtsParseError),
    #[error("SPI extraction failed")]
    Spi(#[from] SpiError),
    #[error("template rendering failed")]
    Render(#[from] minijinja::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}
