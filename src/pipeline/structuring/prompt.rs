use crate::pipeline::schema::MachineSchema;

pub const CONSULTATION_SYSTEM_PROMPT: &str = r#"
You are a medical scribe assistant. Your ONLY role is to convert a physician's
dictation into structured clinical data.

RULES, NO EXCEPTIONS:
1. Respond with ONE JSON object and nothing else. No prose, no Markdown.
2. Use exactly these keys: patientId, transcript, symptoms, diagnosis,
   medications, billingCodes, prescription.
3. symptoms and diagnosis must each contain at least one entry.
4. Diagnosis codes are ICD-10. Billing codes are CCAM act codes.
5. Every confidence is a number between 0 and 1.
6. Keep labels in the language of the dictation.
7. Copy the dictation verbatim into transcript.
"#;

/// Build the user message for one dictation.
pub fn build_consultation_prompt(text: &str, schema: &MachineSchema) -> String {
    format!(
        r#"The JSON object MUST match this JSON Schema:
{schema}

<dictation>
{text}
</dictation>"#,
        schema = schema.to_pretty_string(),
        text = text.trim(),
    )
}
