//! Built-in macros shipped with the binary
//!
//! Parsed like any other macro file, under the core package.

use crate::ingest::SourceFile;
use dagforge_manifest::ParseFileType;

/// Package that owns the built-in macros
pub const CORE_PACKAGE: &str = "dagforge";

const FILES: &[(&str, &str)] = &[
    ("macros/naming.sql", include_str!("core_macros/naming.sql")),
    ("macros/materializations.sql", include_str!("core_macros/materializations.sql")),
    ("macros/generic_tests.sql", include_str!("core_macros/generic_tests.sql")),
];

/// The built-in macro files
pub fn core_macro_files() -> Vec<SourceFile> {
    FILES
        .iter()
        .map(|(path, contents)| SourceFile::new(CORE_PACKAGE, *path, "macros", ParseFileType::Macro, *contents))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{extract_blocks, BlockKind};

    #[test]
    fn built_in_files_parse() {
        let names: Vec<String> = core_macro_files()
            .iter()
            .flat_map(|file| {
                extract_blocks(
                    &file.contents,
                    &[BlockKind::Macro, BlockKind::Test, BlockKind::Materialization],
                )
                .unwrap()
            })
            .map(|b| b.name)
            .collect();
        for expected in [
            "generate_schema_name",
            "generate_alias_name",
            "materialization_view_default",
            "materialization_incremental_default",
            "test_not_null",
            "test_relationships",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
    }
}
