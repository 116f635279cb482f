//! Prompts for document processing
//!
//! One shared system prompt covers the ingestion agents so the provider
//! cache prefix is stable across related calls; task-specific instructions
//! travel in the user message after the document content.

/// Unified system prompt for document analysis tasks (metadata, summary).
pub const DOCUMENT_ANALYSIS_SYSTEM: &str = "\
You are a document analysis specialist. Analyze the provided document and \
follow the task instructions given after the document content.";

/// System prompt for chapter summarization (stable for caching).
pub const CHAPTER_SUMMARIZATION_SYSTEM: &str = "\
You are an expert summarizer specializing in condensing academic and \
technical content while preserving essential meaning.

Your task is to create a summary that captures:
- The main arguments and thesis of the chapter
- Key concepts and findings
- How this chapter contributes to the broader work
- Any significant conclusions or implications

Provide a coherent, well-structured summary in clear prose. Maintain \
academic rigor while being accessible.";

/// Translation system prompt.
pub const TRANSLATION_SYSTEM: &str = "\
You are a skilled translator. Translate the following text accurately to \
English while:
- Preserving the meaning and nuance
- Maintaining academic/professional tone
- Keeping technical terms appropriately translated or retained
- Preserving the markdown structure (headings, formatting)

Output ONLY the English translation, no explanations or preamble.";

/// Short-summary task instruction (~100 words).
pub fn summary_user(content: &str, target_words: usize) -> String {
    format!(
        "{content}\n\n---\n\nCreate a concise summary of approximately {target_words} words \
         capturing the main thesis, key arguments, and conclusions. Focus on what makes \
         this work significant and its core contributions. If the document is not in \
         English, write the summary in the document's language."
    )
}

/// Metadata extraction instruction.
pub fn metadata_user(content: &str) -> String {
    format!(
        "{content}\n\n---\n\nExtract bibliographic metadata from this document excerpt. Look for:\n\
         - title: full document title\n\
         - authors: list of author names (can be empty)\n\
         - date: publication date (any format)\n\
         - publisher: publisher name\n\
         - isbn: ISBN if present\n\n\
         Also determine:\n\
         - is_multi_author: true if this appears to be a multi-author edited volume\n\
         - chapter_authors: mapping of chapter titles to author names (multi-author works only)\n\n\
         Use null for missing values and an empty list for no authors."
    )
}

/// Chapter-boundary analysis instruction over a heading list.
pub fn chapter_analysis_user(heading_list: &str, is_multi_author: bool) -> String {
    let mut prompt = format!(
        "Analyze this list of document headings and identify which ones represent \
         chapter-level divisions. Mark each heading with is_chapter=true if it is a \
         chapter boundary, false otherwise.\n\n\
         Guidelines:\n\
         - Look for consistent patterns (all H1s, or \"Chapter N\" patterns)\n\
         - Chapters are major divisions of the document\n\
         - Sub-sections within chapters are false\n\n\
         Headings:\n{heading_list}"
    );
    if is_multi_author {
        prompt.push_str(
            "\n\nThis is a multi-author work. For each chapter, identify the author name \
             if it is present in the heading.",
        );
    }
    prompt
}

/// Per-chunk chapter summarization instruction.
pub fn chapter_chunk_user(
    content: &str,
    target_words: usize,
    chapter_context: &str,
    chunk: Option<(usize, usize)>,
) -> String {
    let chunk_info = chunk
        .map(|(n, total)| format!(" (Part {n}/{total})"))
        .unwrap_or_default();
    format!(
        "Summarize this content in approximately {target_words} words.\n\n\
         Context: {chapter_context}{chunk_info}\n\nContent:\n{content}"
    )
}

/// Content/metadata cross-check instruction.
pub fn metadata_match_user(content_sample: &str, metadata_json: &str) -> String {
    format!(
        "Does this document content plausibly match the bibliographic metadata? \
         Mark a mismatch ONLY on clear evidence (wrong work entirely, different \
         authors AND different subject). When uncertain, treat it as a match.\n\n\
         ## Metadata\n{metadata_json}\n\n## Content sample\n{content_sample}"
    )
}
