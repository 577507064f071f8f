//! Copyright (C) Microsoft Corporation.
//!
//! This program is free software: you can redistribute it and/or modify
//! it under the terms of the GNU General Public License as published by
//! the Free Software Foundation, either version 3 of the License, or
//! (at your option) any later version.
//!
//! This program is distributed in the hope that it will be useful,
//! but WITHOUT ANY WARRANTY; without even the implied warranty of
//! MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//! GNU General Public License for more details.
//!
//! You should have received a copy of the GNU General Public License
//! along with this program.  If not, see <https://www.gnu.org/licenses/>.
use anyhow::Result;
use clap::Parser;
use ocirepack::error::OciRepackError;
use ocirepack::write;

fn main() {
    match try_main() {
        Ok(()) => {}
        Err(err) => {
            write::error("Error", err.to_string()).unwrap();
            err.chain()
                .skip(1)
                .for_each(|cause| eprintln!("caused by: {}", cause));
            std::process::exit(exit_code(&err));
        }
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<OciRepackError>()
        .map(OciRepackError::exit_code)
        .unwrap_or(1)
}

fn try_main() -> Result<()> {
    let args = ocirepack::cli::Cli::parse();
    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();
    ocirepack::main(args.command)
}
