// All generation prompt constants for the concrete agents.
// Every system prompt enforces JSON-only output; `generate_json` strips
// stray markdown fences anyway.

/// System prompt for the compatibility explanation call.
pub const EXPLANATION_SYSTEM: &str =
    "You are an expert technical recruiter explaining a compatibility score. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT invent facts not present in the scoring report.";

/// Explanation prompt template. Replace `{target_json}` and `{report_json}`.
pub const EXPLANATION_PROMPT_TEMPLATE: &str = r#"Explain the following compatibility result in two or three sentences a recruiter would find useful.

TARGET ROLE:
{target_json}

SCORING REPORT (source of truth - ONLY reference facts from here):
{report_json}

Return a JSON object:
{
  "explanation": "Strong match driven by full required-skill coverage and seven years of relevant tenure; salary expectation overlaps the offered range."
}"#;

/// System prompt for document tailoring.
pub const TAILOR_SYSTEM: &str =
    "You are an expert resume writer producing a tailored candidate document \
    from verified profile data. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT invent facts not present in the candidate profile.";

/// Tailoring prompt template.
/// Replace: {target_json}, {candidate_json}, {sources_json}, {tone}
pub const TAILOR_PROMPT_TEMPLATE: &str = r#"Produce a tailored candidate document for the target role below.

TARGET ROLE:
{target_json}

CANDIDATE PROFILE (source of truth - ONLY use facts from here):
{candidate_json}

VALID SOURCE KEYS (every bullet MUST cite exactly one):
{sources_json}

TONE: {tone}

Return a JSON object:
{
  "summary": "One-paragraph positioning of the candidate for this role",
  "sections": [
    {
      "title": "Experience",
      "bullets": [
        {
          "text": "Led the Kubernetes migration of a 40-service platform",
          "source": "position:0"
        }
      ]
    }
  ]
}

HARD RULES:
1. EVERY bullet MUST carry a `source` matching one of the valid source keys above - no exceptions
2. Use ONLY facts from the candidate profile - no interpolation, no invention
3. Emphasize the target's required skills where the profile actually covers them
4. Keep bullets dense; one strong bullet per fact"#;

/// System prompt for record enrichment normalization.
pub const ENRICH_SYSTEM: &str =
    "You are a data normalizer producing concise candidate highlights from a \
    profile and an external lookup result. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences.";

/// Enrichment prompt template. Replace `{candidate_json}` and `{lookup_json}`.
pub const ENRICH_PROMPT_TEMPLATE: &str = r#"Merge the candidate profile with the external lookup result into a list of short factual highlights.

CANDIDATE PROFILE:
{candidate_json}

EXTERNAL LOOKUP RESULT:
{lookup_json}

Return a JSON object:
{
  "highlights": [
    "Maintains a 2k-star open source Rust crate",
    "Eight years across two backend platform teams"
  ]
}

Highlights must be grounded in the inputs above; do not speculate."#;
