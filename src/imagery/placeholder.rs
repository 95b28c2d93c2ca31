use sha2::{Digest, Sha256};

const SCENARIO_COLORS: [&str; 6] = ["#3B82F6", "#EF4444", "#10B981", "#F59E0B", "#8B5CF6", "#EC4899"];

/// Static SVG shown in place of an image that could not be generated. The
/// tint is derived from the scenario id so each scenario keeps its colour.
pub fn render(scenario_id: &str) -> String {
    let digest = Sha256::digest(scenario_id.as_bytes());
    let color = SCENARIO_COLORS[digest[0] as usize % SCENARIO_COLORS.len()];
    let title = escape_xml(scenario_id);

    format!(
        r#"<svg width="400" height="300" xmlns="http://www.w3.org/2000/svg">
    <defs>
        <linearGradient id="grad" x1="0%" y1="0%" x2="100%" y2="100%">
            <stop offset="0%" style="stop-color:{color};stop-opacity:1" />
            <stop offset="100%" style="stop-color:{color};stop-opacity:0.6" />
        </linearGradient>
    </defs>
    <rect width="400" height="300" fill="url(#grad)" />
    <text x="200" y="150" font-family="Arial, sans-serif" font-size="24" font-weight="bold"
          text-anchor="middle" fill="white">{title}</text>
    <text x="200" y="200" font-family="Arial, sans-serif" font-size="12"
          text-anchor="middle" fill="white" opacity="0.8">Image temporarily unavailable</text>
</svg>"#
    )
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_deterministic_per_scenario() {
        assert_eq!(render("solarpunk"), render("solarpunk"));
        assert!(render("solarpunk").contains(">solarpunk</text>"));
        assert!(render("<odd>").contains("&lt;odd&gt;"));
    }
}
