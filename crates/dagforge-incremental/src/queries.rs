//! Salsa inputs and tracked functions

use dagforge_parser::{parse_file, ParseContext, ParsedFile, SourceFile};

/// Input: one discovered project file
///
/// Changes when the file's contents change on disk.
#[salsa::input]
pub struct SourceFileInput {
    #[returns(ref)]
    pub file: SourceFile,
}

/// Input: the context every file is parsed with
///
/// Changes when target, flags or vars change, which invalidates every file.
#[salsa::input]
pub struct ParseContextInput {
    #[returns(ref)]
    pub context: ParseContext,
}

/// Tracked function: parse one file
///
/// Memoized per file; recomputed only when the file or the context changes.
/// Reverting a file to earlier contents still recomputes once, then the
/// result compares equal and downstream reads are not disturbed.
#[salsa::tracked]
pub fn parse_source_file(db: &dyn salsa::Database, file: SourceFileInput, context: ParseContextInput) -> ParsedFile {
    let source = file.file(db);
    tracing::trace!(file = %source.path, "Parsing file");
    parse_file(context.context(db), source)
}
