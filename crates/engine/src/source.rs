//! Rating corpus sources
//!
//! The batch trainer reads its corpus through [`RatingSource`]. Extraction
//! from upstream systems lives behind this trait; the engine only ships an
//! in-memory source and a JSON-lines file reader.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use latent_core::{LatentError, LatentResult, Rating};
use parking_lot::RwLock;
use tracing::warn;

/// Supplies the full historical rating corpus
pub trait RatingSource: Send + Sync {
    /// Load every rating
    fn load(&self) -> LatentResult<Vec<Rating>>;
}

/// Ratings held in memory; replaceable between training runs
#[derive(Debug, Default)]
pub struct VecSource {
    ratings: RwLock<Vec<Rating>>,
}

impl VecSource {
    /// Source over `ratings`
    pub fn new(ratings: Vec<Rating>) -> Self {
        Self {
            ratings: RwLock::new(ratings),
        }
    }

    /// Append ratings for the next run
    pub fn extend(&self, more: impl IntoIterator<Item = Rating>) {
        self.ratings.write().extend(more);
    }

    /// Number of ratings held
    pub fn len(&self) -> usize {
        self.ratings.read().len()
    }

    /// Whether no ratings are held
    pub fn is_empty(&self) -> bool {
        self.ratings.read().is_empty()
    }
}

impl RatingSource for VecSource {
    fn load(&self) -> LatentResult<Vec<Rating>> {
        Ok(self.ratings.read().clone())
    }
}

/// One `{"user_id", "item_id", "rating"}` object per line.
///
/// Lines that do not parse are skipped with a warning, the way the
/// trainer drops unusable rows.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    path: PathBuf,
}

impl JsonLinesSource {
    /// Source reading `path` on every load
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl RatingSource for JsonLinesSource {
    fn load(&self) -> LatentResult<Vec<Rating>> {
        let file = File::open(&self.path).map_err(|e| {
            LatentError::persistence(format!("open {}: {}", self.path.display(), e))
        })?;
        let mut ratings = Vec::new();
        let mut skipped = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Rating>(&line) {
                Ok(r) => ratings.push(r),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(
                target: "latent::trainer",
                path = %self.path.display(),
                skipped,
                "Skipped unparsable corpus lines"
            );
        }
        Ok(ratings)
    }
}
