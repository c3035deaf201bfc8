pub use std::collections::HashMap;
pub use std::fs::{self, File};
pub use std::io::prelude::*;
pub use std::path::{Path, PathBuf};

pub use eyre::{eyre, WrapErr};
pub use log::{debug, trace, warn};
pub use once_cell::sync::{Lazy, OnceCell};

pub use crate::error::{CacheError, Result};
