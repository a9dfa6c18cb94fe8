//! Enforces the unit test layout: `tests/unit` mirrors `src` file for file

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;
    use std::io;
    use std::path::Path;

    const SRC: &str = "src";
    const UNIT: &str = "tests/unit";

    // Module wiring and entry points carry no logic of their own
    fn is_wiring(relative: &str) -> bool {
        relative == "main.rs" || relative == "lib.rs" || relative.ends_with("mod.rs")
    }

    fn relative_rust_paths(dir: &Path, base: &Path) -> io::Result<BTreeSet<String>> {
        let mut paths = BTreeSet::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let relative = path
                .strip_prefix(base)
                .map_err(|_stripped| io::Error::other("Failed to strip prefix"))?
                .to_string_lossy()
                .replace('\\', "/");
            if path.is_dir() {
                paths.insert(relative);
                paths.extend(relative_rust_paths(&path, base)?);
            } else if path.extension().and_then(|ext| ext.to_str()) == Some("rs") {
                paths.insert(relative);
            }
        }
        Ok(paths)
    }

    fn both_trees() -> (BTreeSet<String>, BTreeSet<String>) {
        let src = relative_rust_paths(Path::new(SRC), Path::new(SRC)).expect("Failed to read src");
        let unit = relative_rust_paths(Path::new(UNIT), Path::new(UNIT)).expect("Failed to read tests/unit");
        (src, unit)
    }

    // Tests every source file and directory has a unit test counterpart
    // Verified by adding a source file without tests
    #[test]
    fn test_all_src_files_have_unit_tests() {
        let (src, unit) = both_trees();
        let missing: Vec<String> = src
            .iter()
            .filter(|path| !is_wiring(path) && !unit.contains(*path))
            .map(|path| format!("  - src/{path} -> {UNIT}/{path}"))
            .collect();
        assert!(
            missing.is_empty(),
            "Source files without unit tests:\n{}",
            missing.join("\n")
        );
    }

    // Tests no unit test file outlives its source file
    // Verified by adding an orphaned test file
    #[test]
    fn test_all_unit_tests_have_src_counterparts() {
        let (src, unit) = both_trees();
        let orphaned: Vec<String> = unit
            .iter()
            .filter(|path| !is_wiring(path) && !src.contains(*path))
            .map(|path| format!("  - {UNIT}/{path} -> src/{path} (missing)"))
            .collect();
        assert!(
            orphaned.is_empty(),
            "Unit test files without a source file:\n{}",
            orphaned.join("\n")
        );
    }

    fn files_without_tests(dir: &Path, found: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                files_without_tests(&path, found)?;
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if path.extension().and_then(|ext| ext.to_str()) != Some("rs") || name == "main.rs" || name == "mod.rs" {
                continue;
            }
            if !fs::read_to_string(&path)?.contains("#[test]") {
                found.push(format!("  - {}", path.display()));
            }
        }
        Ok(())
    }

    // Tests every test file actually defines tests
    // Verified by emptying a unit test file
    #[test]
    fn test_all_test_files_contain_tests() {
        let mut found = Vec::new();
        files_without_tests(Path::new("tests"), &mut found).expect("Failed to scan tests");
        assert!(
            found.is_empty(),
            "Test files without any #[test] function:\n{}",
            found.join("\n")
        );
    }
}
