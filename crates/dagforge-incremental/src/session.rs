//! Incremental project parsing
//!
//! [`IncrementalParser`] keeps a salsa database alive across parses of the
//! same project and can be seeded from a saved parse on disk. Files whose
//! checksum matches the saved result are reused; everything else goes
//! through the memoized [`parse_source_file`] query. Assembly, resolution
//! and linking always rerun over the full set of parsed files.

use crate::db::DagforgeDatabase;
use crate::partial_parse::{PartialParseError, SavedParse};
use crate::queries::{parse_source_file, ParseContextInput, SourceFileInput};
use dagforge_core::Config;
use dagforge_parser::{parse_file, ParseError, ParseOutput, ParsedFile, ProjectParser};
use salsa::Setter;
use std::collections::BTreeMap;

pub struct IncrementalParser {
    parser: ProjectParser,
    db: DagforgeDatabase,
    context: ParseContextInput,
    inputs: BTreeMap<String, SourceFileInput>,
    saved: Option<SavedParse>,
    last: Vec<ParsedFile>,
}

impl IncrementalParser {
    pub fn new(parser: ProjectParser) -> Self {
        let db = DagforgeDatabase::default();
        let context = ParseContextInput::new(&db, parser.context().clone());
        Self {
            parser,
            db,
            context,
            inputs: BTreeMap::new(),
            saved: None,
            last: Vec::new(),
        }
    }

    /// Parser for `config`, seeded from `target/partial_parse.json` when
    /// partial parsing is enabled and the saved state still applies
    pub fn for_config(config: &Config) -> Result<Self, ParseError> {
        let mut session = Self::new(ProjectParser::new(config)?);
        if config.flags.partial_parse {
            let path = SavedParse::path_in(&config.target_dir());
            match SavedParse::load(&path) {
                Ok(Some(saved)) => session.seed(saved),
                Ok(None) => tracing::info!("No saved parse found; parsing every file"),
                Err(err) => tracing::warn!(error = %err, "Ignoring saved parse"),
            }
        }
        Ok(session)
    }

    pub fn parser(&self) -> &ProjectParser {
        &self.parser
    }

    /// Use `saved` for unchanged files, unless a global hash moved
    pub fn seed(&mut self, saved: SavedParse) {
        match saved.rejection(&self.parser.state_check()) {
            Some(reason) => {
                tracing::info!(reason, "Unable to do partial parsing; parsing every file");
                self.saved = None;
            }
            None => self.saved = Some(saved),
        }
    }

    /// Discover files and parse the project, reusing what is unchanged
    pub fn parse(&mut self) -> Result<ParseOutput, ParseError> {
        let files = self.parser.discover()?;
        let mut parsed = Vec::with_capacity(files.len());
        let mut reused = 0;
        let mut live = BTreeMap::new();

        for file in files {
            let file_id = file.file_id();
            if let Some(saved) = self.saved.as_ref().and_then(|s| s.reusable(&file_id, &file.checksum)) {
                reused += 1;
                parsed.push(saved.clone());
                continue;
            }

            let input = match self.inputs.remove(&file_id) {
                Some(input) => {
                    if input.file(&self.db).checksum != file.checksum {
                        input.set_file(&mut self.db).to(file.clone());
                    }
                    input
                }
                None => SourceFileInput::new(&self.db, file.clone()),
            };
            live.insert(file_id, input);

            let result = parse_source_file(&self.db, input, self.context);
            // Memoized results cannot see the environment
            if result.reads_env_vars() {
                parsed.push(parse_file(self.parser.context(), &file));
            } else {
                parsed.push(result);
            }
        }
        // Inputs for deleted files are dropped with the map
        self.inputs = live;

        tracing::info!(files = parsed.len(), reused, "Parsed project files");
        self.last = parsed.clone();
        let mut output = self.parser.assemble(parsed);
        output.stats.reused = reused;
        Ok(output)
    }

    /// Parsed files from the last [`parse`](Self::parse), as a saved parse
    pub fn snapshot(&self) -> SavedParse {
        SavedParse::new(self.parser.state_check(), self.last.iter().cloned())
    }

    /// Write the last parse to `target/partial_parse.json` and keep it as the
    /// seed for the next parse in this process
    pub fn save(&mut self) -> Result<(), PartialParseError> {
        let snapshot = self.snapshot();
        snapshot.write(&SavedParse::path_in(&self.parser.config().target_dir()))?;
        self.saved = Some(snapshot);
        Ok(())
    }
}
