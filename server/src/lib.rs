// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

pub use crate::opt::Opt;
pub use crate::server::run;

#[macro_use]
extern crate log;

pub(crate) mod api;
pub(crate) mod error;
pub(crate) mod hits;
pub(crate) mod opt;
pub(crate) mod server;
