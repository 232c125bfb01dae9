use super::test_helpers::*;
use super::*;
use crate::error::Error;
use crate::storage::MemoryObjectStore;
use crate::types::{DownloadId, Event, Status};
use std::time::Duration;
