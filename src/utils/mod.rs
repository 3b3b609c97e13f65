pub mod path;

use std::path::Path;

/// Remove directories that are subdirectories of other directories in the list.
pub fn non_overlapping_directories(dirs: Vec<String>) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();

    for dir in dirs {
        let dir_path = Path::new(&dir);
        let mut should_add = true;
        let result_clone = result.clone();

        for res_dir in &result_clone {
            let res_dir_path = Path::new(res_dir);

            if dir_path.starts_with(res_dir_path) {
                should_add = false;
                break;
            }

            if res_dir_path.starts_with(dir_path) {
                result.retain(|x| x != res_dir);
                break;
            }
        }

        if should_add {
            result.push(dir);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_overlapping_no_overlap() {
        let dirs = vec![
            "/data/downloads".to_string(),
            "/data/incoming".to_string(),
            "/var/spool".to_string(),
        ];
        let result = non_overlapping_directories(dirs);
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_non_overlapping_with_subdirectory() {
        let dirs = vec![
            "/data/downloads".to_string(),
            "/data/downloads/complete".to_string(),
            "/var/spool".to_string(),
        ];
        let result = non_overlapping_directories(dirs);
        assert_eq!(result.len(), 2);
        assert!(result.contains(&"/data/downloads".to_string()));
        assert!(!result.contains(&"/data/downloads/complete".to_string()));
    }
}
