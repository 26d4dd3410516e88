//! Prompt templates for the extraction collaborator.
//!
//! Templates are string constants filled with `format!`. The expected answer shape is
//! appended per [`ResponseFormat`].

use crate::config::{EdgeTypeSpec, EntityTypeSpec};
use crate::llm::Message;
use crate::models::{Edge, EntityNode, EpisodicNode};

use super::ResponseFormat;

const EXTRACT_ENTITIES_SYSTEM: &str = "You extract entities from text for a knowledge graph. \
An entity is a person, organization, place, project, product, concept or event that is \
explicitly mentioned. Do not extract relationships, actions, dates or pronouns. \
Use the most complete name the text gives for each entity.";

const EXTRACT_RELATIONSHIPS_SYSTEM: &str = "You extract facts that connect entities for a \
temporal knowledge graph. Every fact links exactly two of the listed entities. Name the \
relation in SCREAMING_SNAKE_CASE (for example WORKS_AT, LEADS). Give valid_at when the text \
says when the fact became true and invalid_at when it says the fact stopped being true, as \
ISO 8601 dates resolved against the reference time. Leave them empty otherwise.";

const HYDRATE_SYSTEM: &str = "You maintain short entity summaries for a knowledge graph. \
For each listed entity, write a one or two sentence summary using only the given text and \
the existing summary, and list any concrete attributes the text states.";

const SUMMARIZE_COMMUNITY_SYSTEM: &str = "You name and describe clusters of related \
entities in a knowledge graph. Reply with a JSON object {\"name\": ..., \"summary\": ...}. \
The name is a short title; the summary is at most three sentences.";

const JUDGE_SYSTEM: &str = "You compare two facts about the same pair of entities. Answer \
with exactly one word: RESTATEMENT if the new fact says the same thing as the existing one, \
CONTRADICTION if both cannot be true at the same time, COMPATIBLE otherwise.";

fn previous_block(previous: &[EpisodicNode]) -> String {
    if previous.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = previous
        .iter()
        .map(|ep| format!("- [{}] {}", ep.reference_time().to_rfc3339(), ep.content))
        .collect();
    format!("<PREVIOUS EPISODES>\n{}\n</PREVIOUS EPISODES>\n\n", lines.join("\n"))
}

fn entity_types_block(entity_types: &[EntityTypeSpec]) -> String {
    if entity_types.is_empty() {
        return "Use a short type label such as Person, Organization, Location, Project or Concept.".to_string();
    }
    let lines: Vec<String> = entity_types
        .iter()
        .map(|t| format!("- {}: {}", t.name, t.description))
        .collect();
    format!(
        "Allowed entity types (use Entity when none fits):\n{}",
        lines.join("\n")
    )
}

fn edge_types_block(edge_types: &[EdgeTypeSpec]) -> String {
    if edge_types.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = edge_types
        .iter()
        .map(|t| format!("- {}: {}", t.name, t.description))
        .collect();
    format!("Prefer these relation names when they apply:\n{}\n\n", lines.join("\n"))
}

pub fn extract_entities(
    chunk: &str,
    episode: &EpisodicNode,
    previous: &[EpisodicNode],
    entity_types: &[EntityTypeSpec],
    format: ResponseFormat,
) -> Vec<Message> {
    let answer = match format {
        ResponseFormat::Tabular => "Answer with a table, one entity per row:\nname | entity_type",
        ResponseFormat::Json => {
            "Answer with JSON only:\n{\"entities\": [{\"name\": \"...\", \"entity_type\": \"...\"}]}"
        }
    };
    let user = format!(
        "{}<SOURCE>{}</SOURCE>\n\n<CURRENT EPISODE>\n{}\n</CURRENT EPISODE>\n\n{}\n\n{}",
        previous_block(previous),
        episode.source_description,
        chunk,
        entity_types_block(entity_types),
        answer
    );
    vec![Message::system(EXTRACT_ENTITIES_SYSTEM), Message::user(user)]
}

pub fn extract_relationships(
    chunk: &str,
    episode: &EpisodicNode,
    entities: &[EntityNode],
    previous: &[EpisodicNode],
    edge_types: &[EdgeTypeSpec],
    format: ResponseFormat,
) -> Vec<Message> {
    let entity_lines: Vec<String> = entities
        .iter()
        .map(|e| format!("- {} ({})", e.name, e.entity_type))
        .collect();
    let answer = match format {
        ResponseFormat::Tabular => {
            "Answer with a table, one fact per row:\nsource | relation | target | fact | valid_at | invalid_at"
        }
        ResponseFormat::Json => {
            "Answer with JSON only:\n{\"relationships\": [{\"source\": \"...\", \"relation\": \"...\", \
             \"target\": \"...\", \"fact\": \"...\", \"valid_at\": null, \"invalid_at\": null}]}"
        }
    };
    let user = format!(
        "{}<REFERENCE TIME>{}</REFERENCE TIME>\n\n<CURRENT EPISODE>\n{}\n</CURRENT EPISODE>\n\n\
         <ENTITIES>\n{}\n</ENTITIES>\n\n{}{}",
        previous_block(previous),
        episode.reference_time().to_rfc3339(),
        chunk,
        entity_lines.join("\n"),
        edge_types_block(edge_types),
        answer
    );
    vec![Message::system(EXTRACT_RELATIONSHIPS_SYSTEM), Message::user(user)]
}

pub fn hydrate_attributes(chunk: &str, entities: &[EntityNode], format: ResponseFormat) -> Vec<Message> {
    let entity_lines: Vec<String> = entities
        .iter()
        .map(|e| {
            if e.summary.is_empty() {
                format!("- {} ({})", e.name, e.entity_type)
            } else {
                format!("- {} ({}): {}", e.name, e.entity_type, e.summary)
            }
        })
        .collect();
    let answer = match format {
        ResponseFormat::Tabular => "Answer with a table, one entity per row:\nname | summary",
        ResponseFormat::Json => {
            "Answer with JSON only:\n[{\"name\": \"...\", \"summary\": \"...\", \"attributes\": {}}]"
        }
    };
    let user = format!(
        "<TEXT>\n{}\n</TEXT>\n\n<ENTITIES>\n{}\n</ENTITIES>\n\n{}",
        chunk,
        entity_lines.join("\n"),
        answer
    );
    vec![Message::system(HYDRATE_SYSTEM), Message::user(user)]
}

pub fn summarize_community(members: &[EntityNode]) -> Vec<Message> {
    let lines: Vec<String> = members
        .iter()
        .map(|m| {
            if m.summary.is_empty() {
                format!("- {}", m.name)
            } else {
                format!("- {}: {}", m.name, m.summary)
            }
        })
        .collect();
    vec![
        Message::system(SUMMARIZE_COMMUNITY_SYSTEM),
        Message::user(format!("<MEMBERS>\n{}\n</MEMBERS>", lines.join("\n"))),
    ]
}

pub fn judge_contradiction(existing: &Edge, candidate: &Edge) -> Vec<Message> {
    let user = format!(
        "<EXISTING FACT>{} ({})</EXISTING FACT>\n<NEW FACT>{} ({})</NEW FACT>",
        existing.fact, existing.name, candidate.fact, candidate.name
    );
    vec![Message::system(JUDGE_SYSTEM), Message::user(user)]
}
