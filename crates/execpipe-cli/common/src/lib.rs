// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Common macros and argument structures for the execpipe command line

mod args;

pub use args::{configure_logging, filter_directives, CommandName, Logging};
