//! Prompt packs for the reasoning service.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! The `contract` section becomes the system message and the rest the user
//! message. When a pack is over its byte budget, droppable sections go first
//! and then the last section (always the task page) is truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::types::TaskContent;

const ANALYZE_TEMPLATE: &str = include_str!("prompts/analyze.md");
const VISION_TEMPLATE: &str = include_str!("prompts/vision.md");
const CODE_TEMPLATE: &str = include_str!("prompts/code.md");
const TRANSCRIPT_TEMPLATE: &str = include_str!("prompts/transcript.md");

const SYSTEM_SECTION: &str = "contract";
const DROP_ORDER: [&str; 1] = ["visual"];
const TRUNCATION_MARKER: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex is valid")
});

/// A rendered prompt: system message plus user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPack {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Renders the solver's prompt templates within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("analyze", ANALYZE_TEMPLATE)
            .expect("analyze template should be valid");
        env.add_template("vision", VISION_TEMPLATE)
            .expect("vision template should be valid");
        env.add_template("code", CODE_TEMPLATE)
            .expect("code template should be valid");
        env.add_template("transcript", TRANSCRIPT_TEMPLATE)
            .expect("transcript template should be valid");
        Self { env, budget_bytes }
    }

    /// Plan (or directly answer) a task from its page.
    pub fn analyze(&self, content: &TaskContent, feedback: Option<&str>) -> Result<PromptPack> {
        self.build(
            "analyze",
            context! {
                url => content.url,
                text => content.text.trim(),
                feedback => non_blank(feedback),
            },
        )
    }

    /// Pull the data a question needs out of a screenshot.
    pub fn vision(&self, question: &str) -> Result<PromptPack> {
        self.build("vision", context! { question => question.trim() })
    }

    /// Turn a plan into a program.
    pub fn code(
        &self,
        content: &TaskContent,
        plan: &str,
        visual: Option<&str>,
        feedback: Option<&str>,
        timeout_secs: u64,
    ) -> Result<PromptPack> {
        self.build(
            "code",
            context! {
                url => content.url,
                text => content.text.trim(),
                plan => plan.trim(),
                visual => non_blank(visual),
                feedback => non_blank(feedback),
                timeout_secs => timeout_secs,
            },
        )
    }

    /// Answer an audio task from its transcript.
    pub fn transcript(
        &self,
        content: &TaskContent,
        transcript: &str,
        feedback: Option<&str>,
    ) -> Result<PromptPack> {
        self.build(
            "transcript",
            context! {
                url => content.url,
                text => content.text.trim(),
                transcript => transcript.trim(),
                feedback => non_blank(feedback),
            },
        )
    }

    fn build(&self, name: &str, ctx: minijinja::Value) -> Result<PromptPack> {
        let rendered = self
            .env
            .get_template(name)
            .and_then(|template| template.render(ctx))
            .with_context(|| format!("render {name} prompt"))?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(split_pack(&sections))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Parse sections from rendered template output.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    if total_len(sections) <= budget {
        return;
    }

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let other_len: usize = sections
        .iter()
        .rev()
        .skip(1)
        .map(|s| s.content.len())
        .sum();
    let Some(last) = sections.last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(other_len);
    if last.content.len() <= allowed {
        return;
    }
    let before_len = last.content.len();
    if allowed > TRUNCATION_MARKER.len() {
        truncate_at_char_boundary(&mut last.content, allowed - TRUNCATION_MARKER.len());
        last.content.push_str(TRUNCATION_MARKER);
    } else {
        truncate_at_char_boundary(&mut last.content, allowed);
    }
    debug!(
        section = last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn truncate_at_char_boundary(text: &mut String, max_len: usize) {
    if text.len() <= max_len {
        return;
    }
    let mut cut = max_len;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn split_pack(sections: &[ParsedSection]) -> PromptPack {
    let system = sections
        .iter()
        .filter(|s| s.key == SYSTEM_SECTION)
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let user = sections
        .iter()
        .filter(|s| s.key != SYSTEM_SECTION)
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    PromptPack { system, user }
}
