//! Prompts for the summarisation stages.
//!
//! Every prompt the pipeline sends lives here so wording changes never touch
//! stage or retry code, and tests can inspect prompts without a model.
//!
//! Image and table summaries are asked for in a tagged layout
//! (`<title>`, `<summary>`, `<entities>`, `<hypothetical_questions>`). The
//! tags are kept verbatim in the ledger; they make the summaries easy to
//! split later and give the embedding index retrieval-friendly phrasing.

/// System prompt for summarising the text of one page.
pub const PAGE_SUMMARY_SYSTEM_PROMPT: &str = r#"You are an expert analyst of business and research reports.
Summarise the page text you are given so it can be retrieved later by search.

Rules:
- Keep every figure, date, name and unit that appears in the text
- Write 3 to 8 sentences in plain prose, no bullet lists
- Do not invent facts that are not in the text
- Output only the summary"#;

/// System prompt for describing an image crop.
pub const IMAGE_SUMMARY_SYSTEM_PROMPT: &str = r#"You are an expert at extracting useful information from images.
Extract the key entities from the image, summarise it, and write information that is useful for search later.
Also provide 5 hypothetical questions a user might ask about the image."#;

/// System prompt for describing a table crop.
pub const TABLE_SUMMARY_SYSTEM_PROMPT: &str = r#"You are an expert at extracting useful information from tables.
Extract the key entities from the table image, summarise it, and write information that is useful for search later.
If the table contains numbers, summarise the important insights they show.
Also provide 5 hypothetical questions a user might ask about the table."#;

/// System prompt for transcribing a table crop to Markdown.
pub const TABLE_MARKDOWN_SYSTEM_PROMPT: &str = r#"You convert table images into Markdown.
Include every cell of the table. Do not explain anything; answer with the Markdown table only."#;

/// User prompt for a page summary.
pub fn page_summary_prompt(page: usize, text: &str, language: &str) -> String {
    format!(
        "Text of page {page}:\n\n\"\"\"{text}\"\"\"\n\nThe summary must be written in {lang}.",
        page = page,
        text = text,
        lang = language_name(language)
    )
}

/// User prompt for an image summary. `context` is the summary of the page the image sits on.
pub fn image_summary_prompt(context: &str, language: &str) -> String {
    format!(
        r#"Context for the image: {context}

###

Output format:

<image>
<title>
[title]
</title>
<summary>
[summary]
</summary>
<entities>
[entities]
</entities>
<hypothetical_questions>
[hypothetical questions]
</hypothetical_questions>
</image>

The output must be written in {lang}."#,
        context = context,
        lang = language_name(language)
    )
}

/// User prompt for a table summary. `context` is the summary of the page the table sits on.
pub fn table_summary_prompt(context: &str, language: &str) -> String {
    format!(
        r#"Context for the table: {context}

###

Output format:

<table>
<title>
[title]
</title>
<summary>
[summary]
</summary>
<entities>
[entities]
</entities>
<data_insights>
[data insights]
</data_insights>
<hypothetical_questions>
[hypothetical questions]
</hypothetical_questions>
</table>

The output must be written in {lang}."#,
        context = context,
        lang = language_name(language)
    )
}

/// User prompt for table transcription.
pub fn table_markdown_prompt(language: &str) -> String {
    format!(
        "Do not wrap the answer in ```markdown fences or XML tags.\n\
         Keep cell text in its original language; write headers you add in {}.",
        language_name(language)
    )
}

/// Human-readable language name for common ISO 639-1 codes; other values pass through.
pub fn language_name(code: &str) -> &str {
    match code.to_ascii_lowercase().as_str() {
        "en" => "English",
        "ko" => "Korean",
        "ja" => "Japanese",
        "zh" => "Chinese",
        "fr" => "French",
        "de" => "German",
        "es" => "Spanish",
        _ => code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_name_the_language() {
        assert!(page_summary_prompt(3, "hello", "ko").ends_with("written in Korean."));
        assert!(image_summary_prompt("ctx", "en").contains("written in English"));
        assert!(table_markdown_prompt("fr").contains("French"));
        assert_eq!(language_name("pt-BR"), "pt-BR");
    }

    #[test]
    fn summary_prompts_carry_context_and_tags() {
        let p = table_summary_prompt("Q3 revenue by region", "en");
        assert!(p.starts_with("Context for the table: Q3 revenue by region"));
        for tag in ["<title>", "<summary>", "<entities>", "<data_insights>", "<hypothetical_questions>"] {
            assert!(p.contains(tag), "missing {tag}");
        }
        let p = image_summary_prompt("", "en");
        assert!(!p.contains("<data_insights>"));
    }

    #[test]
    fn page_prompt_embeds_text_and_number() {
        let p = page_summary_prompt(12, "Net income rose 4%.", "en");
        assert!(p.contains("page 12"));
        assert!(p.contains("Net income rose 4%."));
    }
}
