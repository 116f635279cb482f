//! Supervised review improvement
//!
//! Five staged loops plus a cohesion gate over a running review text:
//! theoretical depth, literature expansion, structural rewriting, parallel
//! section editing, and fact/reference checking, sequenced by the
//! orchestrator.

pub mod cohesion;
pub mod editing;
pub mod factcheck;
pub mod literature;
pub mod orchestrator;
pub mod prompts;
pub mod sections;
pub mod store_query;
pub mod structure;
pub mod theory;
pub mod tools;
pub mod types;

pub use cohesion::check_cohesion;
pub use editing::{
    EditingLoopResult, WordPolicy, check_section_growth, run_editing_loop, word_count_policy,
};
pub use factcheck::{FactCheckLoopResult, filter_ambiguous_claims, run_factcheck_loop};
pub use literature::{
    LiteratureLoopResult, MiniReviewOutput, MiniReviewRunner, run_literature_loop,
};
pub use orchestrator::{LoopSelection, SupervisionOutcome, run_supervision};
pub use sections::{
    SectionInfo, SectionType, detect_section_type, number_paragraphs, split_into_sections,
};
pub use store_query::{PaperContent, StoreQuery};
pub use structure::{StructureLoopResult, run_structure_loop};
pub use theory::{TheoryLoopResult, calculate_completeness, run_theory_loop};
pub use tools::{FactCheckTool, PaperContentTool, PaperCorpus, PaperSearchTool, paper_tools};
pub use types::{
    LoopFailure, MultiLoopProgress, PaperSummary, QualitySettings, SupervisorDecision,
};

use std::collections::HashMap;
use std::sync::Arc;

use thala_core::llm::LlmGateway;
use thala_core::stores::StoreManager;

use crate::web::WebSearchClient;

/// Everything a loop needs: backends, corpus references, topic framing,
/// and the quality settings deriving iteration budgets. Corpus references
/// are read-only inside loops; loops communicate through their results.
pub struct ReviewContext {
    pub stores: Arc<StoreManager>,
    pub gateway: Arc<LlmGateway>,
    pub web: Option<Arc<WebSearchClient>>,
    pub corpus: Arc<PaperCorpus>,
    pub store_query: Arc<StoreQuery>,
    pub quality: QualitySettings,
    /// Verify citations against the bibliographic system (source of truth)
    pub verify_bib: bool,
    pub topic: String,
    pub research_questions: Vec<String>,
    /// Hook into the academic lit-review subworkflow for loop 2
    pub mini_review: Option<Arc<dyn MiniReviewRunner>>,
    /// Enables workflow state dumps
    pub dev_mode: bool,
}

impl ReviewContext {
    /// Assemble a context from its parts.
    pub fn new(
        stores: Arc<StoreManager>,
        gateway: Arc<LlmGateway>,
        topic: impl Into<String>,
        paper_summaries: HashMap<String, PaperSummary>,
        bib_keys: HashMap<String, String>,
    ) -> Self {
        let corpus = Arc::new(PaperCorpus::new(paper_summaries, bib_keys));
        let store_query = Arc::new(StoreQuery::new(stores.clone(), gateway.clone()));
        Self {
            stores,
            gateway,
            web: None,
            corpus,
            store_query,
            quality: QualitySettings::default(),
            verify_bib: true,
            topic: topic.into(),
            research_questions: vec![],
            mini_review: None,
            dev_mode: false,
        }
    }

    pub fn with_web(mut self, web: Arc<WebSearchClient>) -> Self {
        self.web = Some(web);
        self
    }

    pub fn with_quality(mut self, quality: QualitySettings) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_research_questions(mut self, questions: Vec<String>) -> Self {
        self.research_questions = questions;
        self
    }

    pub fn with_mini_review(mut self, runner: Arc<dyn MiniReviewRunner>) -> Self {
        self.mini_review = Some(runner);
        self
    }

    pub fn without_bib_verification(mut self) -> Self {
        self.verify_bib = false;
        self
    }

    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }
}
