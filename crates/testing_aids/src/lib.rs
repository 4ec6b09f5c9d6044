// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An unpublished crate containing testing utilities for use within this repo.

mod log;
mod recorder;
mod settle;

pub use log::*;
pub use recorder::*;
pub use settle::*;
