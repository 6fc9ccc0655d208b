// SPDX-License-Identifier: GPL-3.0

//! String constants for the session store.

/// Directory under the data dir holding one record per session.
pub const SESSIONS_DIR: &str = "sessions";
/// Session record file extension.
pub const RECORD_EXTENSION: &str = "json";
/// Suffix of records being written, renamed into place on completion.
pub const TMP_SUFFIX: &str = "tmp";
/// Suffix given to unreadable records when they are moved aside.
pub const CORRUPT_SUFFIX: &str = "corrupt";
