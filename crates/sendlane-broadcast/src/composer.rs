//! Message composition — turns stored templates into final text per
//! recipient.

use sendlane_core::traits::Composer;
use sendlane_core::types::Recipient;

/// Placeholder-substitution composer: `{name}` and `{phone}` are replaced
/// with recipient fields. An empty name falls back to "there" so greetings
/// stay grammatical.
#[derive(Debug, Default, Clone)]
pub struct TemplateComposer;

impl TemplateComposer {
    pub fn new() -> Self {
        Self
    }
}

impl Composer for TemplateComposer {
    fn render(&self, template: &str, recipient: &Recipient) -> String {
        let name = if recipient.name.is_empty() { "there" } else { recipient.name.as_str() };
        template.replace("{name}", name).replace("{phone}", &recipient.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitutes_placeholders() {
        let composer = TemplateComposer::new();
        let recipient = Recipient::new("+60123", "Ana");
        assert_eq!(
            composer.render("Hi {name}, confirming {phone}", &recipient),
            "Hi Ana, confirming +60123"
        );
    }

    #[test]
    fn test_empty_name_falls_back() {
        let composer = TemplateComposer::new();
        let recipient = Recipient::new("+60123", "");
        assert_eq!(composer.render("Hi {name}!", &recipient), "Hi there!");
    }

    #[test]
    fn test_template_without_placeholders_passes_through() {
        let composer = TemplateComposer::new();
        let recipient = Recipient::new("+60123", "Ana");
        assert_eq!(composer.render("Flash sale today", &recipient), "Flash sale today");
    }
}
