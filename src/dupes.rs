use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use ahash::{AHashMap, AHashSet};
use dashmap::DashMap;
use rayon::prelude::*;
use std::hash::Hasher as _;
use tracing::debug;
use twox_hash::XxHash64;

use crate::app_config::AppConfig;
use crate::model::DuplicateRecord;

const PARTIAL_HASH_LENGTH: usize = 1024 * 1024; // 1 MiB
const NEAR_SIZE_TOLERANCE: f64 = 0.10;

/// A health-validated file eligible for duplicate detection. Corrupt and
/// sample files never get this far.
#[derive(Debug, Clone)]
pub struct DuplicateCandidate {
    pub path: PathBuf,
    pub size: u64,
}

/// Hash of the first 1 MiB: cheap, and two same-size files agreeing on it
/// is high-confidence duplication.
pub fn partial_hash(path: &Path) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0; PARTIAL_HASH_LENGTH];
    let mut filled = 0usize;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buffer.truncate(filled);
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(&buffer);
    Ok(hasher.finish())
}

struct PairHit {
    a: PathBuf,
    b: PathBuf,
    reason: String,
    /// Set by the filename-pattern strategy: the stripped original.
    original: Option<PathBuf>,
}

/// Three converging strategies over an already-validated file set, merged
/// and deduplicated so a pair is reported exactly once.
pub struct DuplicateDetector<'a> {
    favorite_prefix: &'a str,
    copy_markers: &'a [String],
}

impl<'a> DuplicateDetector<'a> {
    pub fn new(config: &'a AppConfig) -> Self {
        Self {
            favorite_prefix: &config.favorite_prefix,
            copy_markers: &config.copy_markers,
        }
    }

    /// `fetch_duration` is only called for near-size bucket members, so
    /// most files are never probed.
    pub fn detect<F>(
        &self,
        candidates: &[DuplicateCandidate],
        mut fetch_duration: F,
    ) -> Vec<DuplicateRecord>
    where
        F: FnMut(&Path) -> Option<f64>,
    {
        let mut hits: Vec<PairHit> = Vec::new();

        let exact_matched = self.exact_size_strategy(candidates, &mut hits);
        self.near_size_strategy(candidates, &exact_matched, &mut fetch_duration, &mut hits);
        self.name_pattern_strategy(candidates, &mut hits);

        self.merge(candidates, hits)
    }

    /// Strategy 1: byte-identical size, then first-MiB hash confirmation.
    fn exact_size_strategy(
        &self,
        candidates: &[DuplicateCandidate],
        hits: &mut Vec<PairHit>,
    ) -> AHashSet<PathBuf> {
        let mut size_groups: AHashMap<u64, Vec<&DuplicateCandidate>> = AHashMap::new();
        for candidate in candidates {
            size_groups.entry(candidate.size).or_default().push(candidate);
        }

        let mut matched: AHashSet<PathBuf> = AHashSet::new();
        for (_, group) in size_groups.into_iter().filter(|(_, g)| g.len() > 1) {
            let hash_groups: DashMap<u64, Vec<PathBuf>> = DashMap::new();
            group.par_iter().for_each(|candidate| {
                match partial_hash(&candidate.path) {
                    Ok(hash) => hash_groups
                        .entry(hash)
                        .or_default()
                        .push(candidate.path.clone()),
                    Err(e) => {
                        tracing::error!("Error hashing '{}': {}", candidate.path.display(), e)
                    }
                }
            });

            for entry in hash_groups.into_iter() {
                let (_, mut paths) = entry;
                if paths.len() < 2 {
                    continue;
                }
                paths.sort();
                for i in 0..paths.len() {
                    for j in (i + 1)..paths.len() {
                        hits.push(PairHit {
                            a: paths[i].clone(),
                            b: paths[j].clone(),
                            reason: "identical size and content hash".to_string(),
                            original: None,
                        });
                    }
                }
                matched.extend(paths);
            }
        }
        matched
    }

    /// Strategy 2: sizes within 10%, equal duration (rounded to the
    /// second), then hash confirmation. Catches re-encodes and trimmed
    /// metadata that exact sizing misses.
    fn near_size_strategy<F>(
        &self,
        candidates: &[DuplicateCandidate],
        exact_matched: &AHashSet<PathBuf>,
        fetch_duration: &mut F,
        hits: &mut Vec<PairHit>,
    ) where
        F: FnMut(&Path) -> Option<f64>,
    {
        let mut remaining: Vec<&DuplicateCandidate> = candidates
            .iter()
            .filter(|c| !exact_matched.contains(&c.path))
            .collect();
        remaining.sort_by_key(|c| c.size);

        let mut durations: AHashMap<PathBuf, Option<f64>> = AHashMap::new();

        let mut start = 0usize;
        while start < remaining.len() {
            let bucket_floor = remaining[start].size;
            let mut end = start + 1;
            while end < remaining.len()
                && remaining[end].size as f64
                    <= bucket_floor as f64 * (1.0 + NEAR_SIZE_TOLERANCE)
            {
                end += 1;
            }

            if end - start > 1 {
                let bucket = &remaining[start..end];
                let mut by_duration: AHashMap<i64, Vec<&DuplicateCandidate>> = AHashMap::new();
                for candidate in bucket {
                    let duration = *durations
                        .entry(candidate.path.clone())
                        .or_insert_with(|| fetch_duration(&candidate.path));
                    if let Some(duration) = duration {
                        by_duration
                            .entry(duration.round() as i64)
                            .or_default()
                            .push(candidate);
                    }
                }

                for (_, group) in by_duration.into_iter().filter(|(_, g)| g.len() > 1) {
                    for i in 0..group.len() {
                        for j in (i + 1)..group.len() {
                            let (ha, hb) = (
                                partial_hash(&group[i].path),
                                partial_hash(&group[j].path),
                            );
                            if let (Ok(ha), Ok(hb)) = (ha, hb) {
                                if ha == hb {
                                    hits.push(PairHit {
                                        a: group[i].path.clone(),
                                        b: group[j].path.clone(),
                                        reason: "near-identical size and equal duration"
                                            .to_string(),
                                        original: None,
                                    });
                                }
                            }
                        }
                    }
                }
            }

            start = end;
        }
    }

    /// Strategy 3: a copy marker anchored at the end of the stem, whose
    /// stripped original exists in the candidate set.
    fn name_pattern_strategy(&self, candidates: &[DuplicateCandidate], hits: &mut Vec<PairHit>) {
        let known: AHashSet<&Path> = candidates.iter().map(|c| c.path.as_path()).collect();

        for candidate in candidates {
            let Some(name) = candidate.path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(original_name) = self.copy_original_name(name) else {
                continue;
            };
            let original = candidate.path.with_file_name(&original_name);
            if known.contains(original.as_path()) {
                debug!(
                    "{} looks like a named copy of {}",
                    candidate.path.display(),
                    original.display()
                );
                hits.push(PairHit {
                    a: original.clone(),
                    b: candidate.path.clone(),
                    reason: format!("copy marker in filename ('{}')", name),
                    original: Some(original),
                });
            }
        }
    }

    /// The copy marker must be anchored at the end of the stem; a marker
    /// word in the middle of a title does not count.
    fn copy_original_name(&self, file_name: &str) -> Option<String> {
        let (stem, ext) = match file_name.rsplit_once('.') {
            Some((s, e)) => (s, Some(e)),
            None => (file_name, None),
        };

        let rebuild = |base: &str| match ext {
            Some(ext) => format!("{}.{}", base.trim_end(), ext),
            None => base.trim_end().to_string(),
        };

        for marker in self.copy_markers {
            if let Some(base) = stem.strip_suffix(marker.as_str()) {
                if !base.trim_end().is_empty() {
                    return Some(rebuild(base));
                }
            }
        }

        // Parenthesized suffixes: "name (1)", "name (copy)", "name(2)".
        if stem.ends_with(')') {
            if let Some(open) = stem.rfind('(') {
                let inner = &stem[open + 1..stem.len() - 1];
                let numeric = !inner.is_empty()
                    && inner.len() <= 2
                    && inner.chars().all(|c| c.is_ascii_digit());
                let word = matches!(inner, "copy" | "duplicate" | "dup");
                let base = stem[..open].trim_end();
                if (numeric || word) && !base.is_empty() {
                    return Some(rebuild(base));
                }
            }
        }

        None
    }

    fn is_favorite(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(self.favorite_prefix))
    }

    /// Merge hits into unique pair records, then pick the keeper:
    /// favorite prefix beats everything, then the pattern original, then
    /// the larger file, then the shorter name.
    fn merge(
        &self,
        candidates: &[DuplicateCandidate],
        hits: Vec<PairHit>,
    ) -> Vec<DuplicateRecord> {
        let sizes: AHashMap<&Path, u64> = candidates
            .iter()
            .map(|c| (c.path.as_path(), c.size))
            .collect();

        let mut merged: AHashMap<(PathBuf, PathBuf), (String, Option<PathBuf>)> = AHashMap::new();
        for hit in hits {
            let PairHit {
                a,
                b,
                reason,
                original,
            } = hit;
            let key = if a <= b { (a, b) } else { (b, a) };
            let entry = merged.entry(key).or_insert_with(move || (reason, None));
            if entry.1.is_none() {
                entry.1 = original;
            }
        }

        let mut records: Vec<DuplicateRecord> = merged
            .into_iter()
            .map(|((a, b), (reason, original))| {
                let keeper_is_a = self.keeper_is_first(&a, &b, original.as_deref(), &sizes);
                let (keeper, candidate) = if keeper_is_a { (a, b) } else { (b, a) };
                DuplicateRecord {
                    candidate,
                    keeper,
                    reason,
                }
            })
            .collect();
        records.sort_by(|x, y| x.candidate.cmp(&y.candidate));
        records
    }

    fn keeper_is_first(
        &self,
        a: &Path,
        b: &Path,
        original: Option<&Path>,
        sizes: &AHashMap<&Path, u64>,
    ) -> bool {
        let (fav_a, fav_b) = (self.is_favorite(a), self.is_favorite(b));
        if fav_a != fav_b {
            return fav_a;
        }

        if let Some(original) = original {
            if original == a {
                return true;
            }
            if original == b {
                return false;
            }
        }

        let size_a = sizes.get(a).copied().unwrap_or(0);
        let size_b = sizes.get(b).copied().unwrap_or(0);
        if size_a != size_b {
            return size_a > size_b;
        }

        let name_len = |p: &Path| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.len())
                .unwrap_or(usize::MAX)
        };
        name_len(a) <= name_len(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::AppConfig;
    use std::fs;

    fn detector(config: &AppConfig) -> DuplicateDetector<'_> {
        DuplicateDetector::new(config)
    }

    fn candidate(path: &Path) -> DuplicateCandidate {
        DuplicateCandidate {
            path: path.to_path_buf(),
            size: fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        }
    }

    #[test]
    fn test_identical_files_detected_once() {
        let config = AppConfig::default();
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("x.mp4");
        let b = tmp.path().join("x (copy).mp4");
        fs::write(&a, vec![0xAB; 4096]).unwrap();
        fs::write(&b, vec![0xAB; 4096]).unwrap();

        let candidates = vec![candidate(&a), candidate(&b)];
        let records = detector(&config).detect(&candidates, |_| None);

        // Found by both the hash and the filename strategies, merged to one.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].keeper, a);
        assert_eq!(records[0].candidate, b);
    }

    #[test]
    fn test_no_mirrored_pairs() {
        let config = AppConfig::default();
        let tmp = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..3)
            .map(|i| {
                let p = tmp.path().join(format!("dup{}.mkv", i));
                fs::write(&p, vec![0x11; 2048]).unwrap();
                p
            })
            .collect();

        let candidates: Vec<DuplicateCandidate> = paths.iter().map(|p| candidate(p)).collect();
        let records = detector(&config).detect(&candidates, |_| None);

        // 3 identical files -> 3 unique pairs, no (A,B)/(B,A) mirrors.
        assert_eq!(records.len(), 3);
        let mut seen = std::collections::HashSet::new();
        for r in &records {
            let key = if r.candidate <= r.keeper {
                (r.candidate.clone(), r.keeper.clone())
            } else {
                (r.keeper.clone(), r.candidate.clone())
            };
            assert!(seen.insert(key), "mirrored pair reported");
        }
    }

    #[test]
    fn test_favorite_prefix_wins() {
        let config = AppConfig::default();
        let tmp = tempfile::tempdir().unwrap();
        let plain = tmp.path().join("movie.mkv");
        let favorite = tmp.path().join("keep-movie.mkv");
        fs::write(&plain, vec![0x22; 4096]).unwrap();
        fs::write(&favorite, vec![0x22; 4096]).unwrap();

        let candidates = vec![candidate(&plain), candidate(&favorite)];
        let records = detector(&config).detect(&candidates, |_| None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].keeper, favorite);
    }

    #[test]
    fn test_near_size_with_duration() {
        let config = AppConfig::default();
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("cut-one.mkv");
        let b = tmp.path().join("cut-two.mkv");
        // Identical first MiB, ~4% size difference.
        fs::write(&a, vec![0x33; 1_100_000]).unwrap();
        fs::write(&b, vec![0x33; 1_150_000]).unwrap();

        let candidates = vec![candidate(&a), candidate(&b)];
        let records = detector(&config).detect(&candidates, |_| Some(1800.2));
        assert_eq!(records.len(), 1);
        // Larger file kept on a plain near-size match.
        assert_eq!(records[0].keeper, b);
    }

    #[test]
    fn test_copy_marker_must_be_suffix() {
        let config = AppConfig::default();
        let d = detector(&config);
        assert_eq!(
            d.copy_original_name("x (copy).mp4"),
            Some("x.mp4".to_string())
        );
        assert_eq!(d.copy_original_name("x (2).mp4"), Some("x.mp4".to_string()));
        assert_eq!(d.copy_original_name("x-copy.mp4"), Some("x.mp4".to_string()));
        assert_eq!(d.copy_original_name("copy of x.mp4"), None);
        assert_eq!(d.copy_original_name("copycat.mp4"), None);
        assert_eq!(d.copy_original_name("x (1999).mp4"), None);
    }
}
