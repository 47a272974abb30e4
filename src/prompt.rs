//! Prompt builders for rewriting, grounded answers, data analysis and
//! suggestions.

use std::fmt::Write;

use crate::models::{ConversationTurn, Role};

fn render_history(history: &[ConversationTurn]) -> String {
    let mut out = String::new();
    for turn in history {
        let speaker = match turn.role {
            Role::User => "User",
            Role::Model => "Model",
        };
        let _ = writeln!(out, "{}: {}", speaker, turn.content);
    }
    out
}

/// Ask for a standalone version of `question` given the dialogue so far.
pub fn rewrite_prompt(history: &[ConversationTurn], question: &str) -> String {
    format!(
        "Given the conversation below and a follow-up question, rewrite the follow-up \
         as a standalone search query. Resolve pronouns and references against the \
         conversation. Keep the language of the question. Return only the rewritten \
         query, with no explanation or quotes.\n\n\
         CONVERSATION:\n{}\n\
         FOLLOW-UP QUESTION:\n{}\n\n\
         STANDALONE QUERY:",
        render_history(history),
        question
    )
}

const ANSWER_RULES: &str = "\
You are an assistant that answers questions using the provided documents.

CITATION RULES:
- Every fact taken from a document must cite the document name in parentheses, \
e.g. (handbook.pdf).
- Use the file name exactly as it appears in the [Document: ...] label. Never invent file names.
- When several consecutive sentences come from the same document, cite it once at the \
end of the paragraph rather than after every sentence.
- Cite again only when the information switches to a different document. Combine \
names when a sentence draws on several, e.g. (a.pdf, b.txt).
";

/// The grounded answer prompt: rules, history, retrieved context, question.
pub fn answer_prompt(question: &str, context: &[String], history: &[ConversationTurn]) -> String {
    let mut prompt = String::from(ANSWER_RULES);
    prompt.push('\n');

    if !history.is_empty() {
        prompt.push_str("CONVERSATION HISTORY:\n\n");
        prompt.push_str(&render_history(history));
        prompt.push('\n');
    }

    if context.is_empty() {
        prompt.push_str(
            "No relevant documents were found for this question. Say so plainly and do \
             not make up an answer from the documents.\n\n",
        );
    } else {
        prompt.push_str("DOCUMENT CONTEXT:\n\n");
        for doc in context {
            prompt.push_str(doc);
            prompt.push_str("\n\n");
        }
        prompt.push_str(
            "Use the information above to answer the question below. If it is not \
             sufficient, say that you do not have enough information.\n\n",
        );
    }

    let _ = write!(
        prompt,
        "CURRENT QUESTION:\n{}\n\n\
         Answer taking the conversation history and the document context into account, \
         following the citation rules.",
        question
    );
    prompt
}

/// Ask for pandas code answering `question` over the previewed data.
pub fn analysis_code_prompt(question: &str, preview: &str) -> String {
    format!(
        "You write Python code that answers a question about a tabular data file.\n\n\
         The file is already loaded into a pandas DataFrame named `df`. Its structure:\n\
         {}\n\
         Rules:\n\
         - Use only `df`, pandas and matplotlib; do not import os, sys or subprocess\n\
         - Do not read or write files and do not call eval, exec or open\n\
         - print() every result the answer needs\n\
         - Draw charts with matplotlib; they are captured automatically\n\
         - Output only the code, with no explanation and no markdown fences\n\n\
         QUESTION:\n{}",
        preview, question
    )
}

/// Wrap analysis output as the single context document for interpretation.
pub fn analysis_context(source_file: &str, output: &str, chart_count: usize) -> String {
    let mut ctx = format!(
        "[Document: {}]\nResult of running the analysis program over this file:\n\n{}",
        source_file, output
    );
    if chart_count > 0 {
        let _ = write!(
            ctx,
            "\n\n{} chart(s) were generated and are shown to the user separately. \
             Use the figures above to explain what they show.",
            chart_count
        );
    }
    ctx.push_str(
        "\n\nExplain this result to the user in natural, concise language. Do not show \
         code or raw data structures unless asked.",
    );
    ctx
}

/// Ask for 3-4 short questions about `excerpt`, as a JSON array.
pub fn suggestion_prompt(excerpt: &str) -> String {
    format!(
        "Based on the text below, write 3-4 short, specific questions a user might ask \
         about this document.\n\n\
         Document text:\n{}\n\n\
         Instructions:\n\
         - Questions must be relevant to the content\n\
         - At most 15 words each\n\
         - Output a JSON array of strings only, e.g. [\"Question 1?\", \"Question 2?\"]\n\
         - No explanation, no extra text",
        excerpt
    )
}
