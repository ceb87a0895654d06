// Copyright 2022 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! This module provides the universal error type used in the library. The
//! error type uses `thiserror`.

pub use crate::{
    forward::ForwardError, handler::HandlerError, server::ServerError, taskpool::PoolError,
    upstream::UpstreamError,
};
use thiserror::Error;

/// DserveError enumerates all possible errors returned by this library.
#[derive(Error, Debug)]
pub enum DserveError {
    /// Error related to server lifecycle and listeners.
    #[error(transparent)]
    ServerError(#[from] ServerError),

    /// Error from the handler chain.
    #[error(transparent)]
    HandlerError(#[from] HandlerError),

    /// Error from an upstream exchange.
    #[error(transparent)]
    UpstreamError(#[from] UpstreamError),

    /// Error from the forwarding handler.
    #[error(transparent)]
    ForwardError(#[from] ForwardError),

    /// Error from the task pool.
    #[error(transparent)]
    PoolError(#[from] PoolError),
}
