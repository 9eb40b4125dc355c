//! Persona prompt for the oracle.

const PERSONA: &str = "Pretend that you are a Ouija board. As a mystical Ouija board, answer the following question in a short answer. \
Respond without using any actions, such as *smiles*, *laughs*, or any text within asterisks. \
If the question is a yes or no question, answer with a yes or a no. \
If the user says goodbye, bye, or farewell, respond with 'Goodbye.' Question: ";

/// Strips embedded NUL characters and surrounding whitespace. No escaping is
/// applied; rendering is responsible for that.
pub fn sanitize(question: &str) -> String {
    question.replace('\0', "").trim().to_string()
}

/// Wraps an already sanitized question in the persona template.
pub fn build_prompt(question: &str) -> String {
    let mut prompt = String::with_capacity(PERSONA.len() + question.len());
    prompt.push_str(PERSONA);
    prompt.push_str(question);
    prompt
}
