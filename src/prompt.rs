//! Prompt assembly for chat providers
//!
//! Turns a [`GenerationRequest`] into a system prompt and a sectioned
//! generation prompt. Only the provider layer uses this; the orchestrator
//! hands over structured data.

use crate::generator::GenerationRequest;
use crate::types::Difficulty;

/// Reference questions shown to the model at most
const MAX_REFERENCES: usize = 8;

/// After this many accepted questions, ask explicitly for new angles
const DIVERSITY_NOTE_AFTER: usize = 20;

fn confusion_techniques(difficulty: Difficulty) -> &'static [&'static str] {
    match difficulty {
        Difficulty::Medium => &[
            "Combine two related but distinct domains in one question",
            "Use phrasing that could apply to more than one context",
            "Ask about a topic that spans two intent categories",
        ],
        Difficulty::Hard => &[
            "Use ambiguous phrasing that makes intent classification unclear",
            "Mix location-specific context with unrelated topics",
            "Combine temporal queries with procedural questions",
            "Ask compound questions spanning different domains",
            "Use conditional phrasing (if/then) that involves multiple intents",
        ],
        Difficulty::Expert => &[
            "Create a question where 3+ intents are genuinely interleaved",
            "Use hypothetical scenarios that blend several intents at once",
            "Embed one intent's question inside another intent's scenario",
            "Ask about cascading effects that cross multiple intent domains",
            "Create a question with implicit intent that requires deep parsing",
        ],
    }
}

pub struct PromptBuilder;

impl PromptBuilder {
    /// System prompt: role, plus the capabilities of the chatbot under test
    pub fn system_prompt(system_context: &str) -> String {
        let mut prompt = String::from(
            "You are an expert question designer for evaluating chatbots. \
             Your goal is to generate realistic, confusing, multi-intent questions that \
             a real user might ask. These questions should be challenging for intent \
             classification systems to categorize correctly.\n\n",
        );
        if !system_context.trim().is_empty() {
            prompt.push_str("The chatbot you are testing has the following capabilities:\n");
            prompt.push_str(system_context.trim());
            prompt.push_str("\n\n");
        }
        prompt.push_str("IMPORTANT: Generate all questions in ENGLISH only.");
        prompt
    }

    pub fn generation_prompt(request: &GenerationRequest) -> String {
        let mut sections: Vec<String> = Vec::new();

        sections.push("## TARGET INTENT MIX\n".to_string());
        sections.push(
            "Generate questions that blend the following intents. Each question should \
             genuinely confuse an intent classifier about which category it belongs to.\n"
                .to_string(),
        );
        for entry in &request.intents {
            let intent = &entry.intent;
            sections.push(format!(
                "- **Intent {}: {}** (weight: {})\n  Primary intent: {}\n  Key signals: {}\n  Description: {}\n",
                intent.id,
                intent.name,
                entry.weight,
                intent.primary_category,
                intent.key_signals.join(", "),
                intent.description
            ));
        }

        if !request.reference_questions.is_empty() {
            sections.push("\n## REFERENCE QUESTIONS (DO NOT DUPLICATE)\n".to_string());
            sections.push(
                "These are existing questions in the database. Use them as stylistic \
                 reference but DO NOT copy or closely paraphrase them:\n"
                    .to_string(),
            );
            for (i, (question, score)) in request.reference_questions.iter().take(MAX_REFERENCES).enumerate() {
                sections.push(format!("  {}. {} (similarity: {:.2})", i + 1, question, score));
            }
        }

        let names: Vec<&str> = request.intents.iter().map(|e| e.intent.name.as_str()).collect();
        let weights: Vec<String> = request
            .intents
            .iter()
            .map(|e| format!("{}={}", e.intent.name, e.weight))
            .collect();

        sections.push("\n## GENERATION REQUIREMENTS\n".to_string());
        sections.push(format!("- Generate exactly **{}** questions", request.batch_size));
        sections.push(format!(
            "- Each question must blend {} intents: {}",
            request.intents.len(),
            names.join(", ")
        ));
        sections.push(format!("- Intent weight distribution: {}", weights.join(", ")));
        sections.push(format!(
            "- Difficulty level: **{}**",
            request.difficulty.as_str().to_uppercase()
        ));
        sections.push("- All questions must be in **English**".to_string());
        sections.push("- Questions must be realistic, something a user would actually ask".to_string());
        sections.push("- Questions must be answerable by the chatbot".to_string());
        sections.push("- Questions should test edge cases of intent classification".to_string());

        sections.push(format!(
            "\n## CONFUSION TECHNIQUES TO USE (Difficulty: {})\n",
            request.difficulty
        ));
        for technique in confusion_techniques(request.difficulty) {
            sections.push(format!("- {}", technique));
        }

        if request.running_count > DIVERSITY_NOTE_AFTER {
            sections.push(format!(
                "\n## DIVERSITY NOTE\nYou have already generated {} questions. Ensure these \
                 questions explore NEW angles, settings and phrasings. Avoid repeating \
                 patterns from earlier generations.",
                request.running_count
            ));
        }

        sections.push(
            "\n## OUTPUT FORMAT\n\
             Respond with a JSON array. Each element must be an object with these fields:\n\
             ```json\n\
             [\n  {\n    \"question\": \"The generated question text in English\",\n    \
             \"expected_intents\": [<intent_id_1>, <intent_id_2>],\n    \
             \"confusion_points\": [\n      \"Brief explanation of why this is confusing for classifiers\"\n    ]\n  }\n]\n\
             ```\n\
             Return ONLY the JSON array, no other text."
                .to_string(),
        );

        sections.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::MixEntry;
    use crate::taxonomy::sample_intents;

    fn request(running_count: usize) -> GenerationRequest {
        let intents = sample_intents(2)
            .into_iter()
            .map(|intent| MixEntry { intent, weight: 0.5 })
            .collect();
        GenerationRequest {
            system_context: "Answers questions about crops".to_string(),
            intents,
            reference_questions: (0..10).map(|i| (format!("reference {}", i), 0.8)).collect(),
            difficulty: Difficulty::Expert,
            running_count,
            batch_size: 4,
        }
    }

    #[test]
    fn test_generation_prompt_sections() {
        let prompt = PromptBuilder::generation_prompt(&request(3));
        assert!(prompt.contains("**Intent 1: Intent 1** (weight: 0.5)"));
        assert!(prompt.contains("Key signals: signal-2-a, signal-2-b"));
        assert!(prompt.contains("Generate exactly **4** questions"));
        assert!(prompt.contains("Difficulty level: **EXPERT**"));
        assert!(prompt.contains("8. reference 7 (similarity: 0.80)"));
        assert!(!prompt.contains("reference 8"));
        assert!(!prompt.contains("DIVERSITY NOTE"));
        assert!(prompt.ends_with("Return ONLY the JSON array, no other text."));
    }

    #[test]
    fn test_diversity_note_after_threshold() {
        let prompt = PromptBuilder::generation_prompt(&request(21));
        assert!(prompt.contains("You have already generated 21 questions"));
    }

    #[test]
    fn test_system_prompt_embeds_context() {
        let prompt = PromptBuilder::system_prompt("  Answers questions about crops\n");
        assert!(prompt.contains("following capabilities:\nAnswers questions about crops\n"));
        assert!(!PromptBuilder::system_prompt("").contains("capabilities"));
    }
}
