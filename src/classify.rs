//! Structural classifier for energy-label markers.
//!
//! Given rendered markup for one product page, decides three independent
//! tri-state predicates: product fiche link, energy-label badge, and the
//! mouseover (popover) label. Each predicate is a required containment
//! path of structural markers; a missing ancestor short-circuits to `No`
//! without examining descendants. The classifier is a pure function of the
//! markup — no retries, no I/O.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Accepted link texts for the product fiche, across the regional
/// storefronts. Matched case-insensitively by containment.
const FICHE_LABELS: &[&str] = &[
    "product fiche",
    "produktdatenblatt",
    "fiche produit",
    "scheda prodotto",
    "ficha del producto",
    "productinformatieblad",
];

/// Energy efficiency class token, e.g. "A", "B", "A+++".
const ENERGY_CLASS_PATTERN: &str = r"^[A-G]\+{0,3}$";

/// Outcome of one predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mark {
    #[serde(rename = "Y")]
    Yes,
    #[serde(rename = "N")]
    No,
    Error,
}

impl std::fmt::Display for Mark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Yes => "Y",
            Self::No => "N",
            Self::Error => "Error",
        })
    }
}

/// The three predicate outcomes for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub product_fiche: Mark,
    pub energy_label: Mark,
    pub mouseover_label: Mark,
}

impl Classification {
    /// The terminal result for a page that could not be analyzed.
    pub fn all_error() -> Self {
        Self {
            product_fiche: Mark::Error,
            energy_label: Mark::Error,
            mouseover_label: Mark::Error,
        }
    }
}

/// Counts of structural markers found, for debugging. Never affects the
/// predicate outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub fiche_links: usize,
    pub label_images: usize,
    pub popover_badges: usize,
    pub fake_badges: usize,
}

/// Classifier result: the three marks plus the diagnostic payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedPage {
    pub marks: Classification,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    #[error("rendered markup is empty")]
    EmptyMarkup,
}

/// Coarse page kind, checked before classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// A product detail page — classification applies.
    Product,
    /// The marketplace's automated-traffic interstitial.
    RobotCheck,
    /// Rendered fine but is not a product detail page.
    NotProduct,
}

fn sel(css: &str) -> Selector {
    // Selectors here are static and known-valid.
    Selector::parse(css).unwrap()
}

/// Decide what kind of page the markup is.
pub fn page_kind(html: &str) -> PageKind {
    let doc = Html::parse_document(html);

    let captcha_form = sel(r#"form[action*="validateCaptcha"]"#);
    if doc.select(&captcha_form).next().is_some() {
        return PageKind::RobotCheck;
    }
    let title = sel("title");
    if let Some(t) = doc.select(&title).next() {
        if collect_text(&t).to_lowercase().contains("robot check") {
            return PageKind::RobotCheck;
        }
    }

    let root = sel("#dp-container");
    if doc.select(&root).next().is_some() {
        PageKind::Product
    } else {
        PageKind::NotProduct
    }
}

/// Classify rendered markup against all three predicates.
pub fn classify(html: &str) -> Result<ClassifiedPage, ClassifyError> {
    if html.trim().is_empty() {
        return Err(ClassifyError::EmptyMarkup);
    }

    let doc = Html::parse_document(html);
    let mut diagnostics = Diagnostics::default();

    let product_fiche = check_product_fiche(&doc, &mut diagnostics);
    let energy_label = check_energy_label(&doc, &mut diagnostics);
    let mouseover_label = check_mouseover_label(&doc, &mut diagnostics);

    Ok(ClassifiedPage {
        marks: Classification {
            product_fiche: to_mark(product_fiche),
            energy_label: to_mark(energy_label),
            mouseover_label: to_mark(mouseover_label),
        },
        diagnostics,
    })
}

fn to_mark(present: bool) -> Mark {
    if present {
        Mark::Yes
    } else {
        Mark::No
    }
}

/// Concatenated text of an element's subtree, whitespace-normalized.
fn collect_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").trim().to_string()
}

/// A link qualifies as a fiche link when it has a real destination and its
/// text names the fiche in one of the regional storefront languages.
fn is_fiche_link(a: &ElementRef<'_>) -> bool {
    let href = a.value().attr("href").unwrap_or("").trim();
    if href.is_empty() || href == "#" || href.starts_with("javascript:") {
        return false;
    }
    let text = collect_text(a).to_lowercase();
    FICHE_LABELS.iter().any(|label| text.contains(label))
}

/// Predicate 1: product fiche link.
///
/// Strict path: `#dp-container` → `div.product-fiche` → `a[href]`.
/// This predicate allows a document-wide loose fallback: the fiche link is
/// sometimes rendered outside the fiche section (e.g. in the detail
/// bullets), so any qualifying anchor counts when the strict path fails.
fn check_product_fiche(doc: &Html, diagnostics: &mut Diagnostics) -> bool {
    let root = sel("#dp-container");
    let section = sel("div.product-fiche");
    let anchor = sel("a[href]");

    let mut found = false;
    for container in doc.select(&root) {
        for fiche in container.select(&section) {
            for a in fiche.select(&anchor) {
                if is_fiche_link(&a) {
                    diagnostics.fiche_links += 1;
                    found = true;
                }
            }
        }
    }
    if found {
        return true;
    }

    // Loose fallback: qualifying anchor anywhere in the document.
    for a in doc.select(&anchor) {
        if is_fiche_link(&a) {
            diagnostics.fiche_links += 1;
            found = true;
        }
    }
    found
}

/// Predicate 2: energy-label badge image.
///
/// Strict path only: `#dp-container` → `div.energy-efficiency-label` →
/// `img` with a real `src`, carrying either an energy-class token
/// ("A"…"G", with up to three plus signs) or the word "energy" in its alt
/// text. When the alt text is empty, the surrounding label container's
/// text is checked for a class token instead.
fn check_energy_label(doc: &Html, diagnostics: &mut Diagnostics) -> bool {
    let root = sel("#dp-container");
    let label = sel("div.energy-efficiency-label");
    let image = sel("img");
    let class_re = Regex::new(ENERGY_CLASS_PATTERN).unwrap();

    let mut found = false;
    for container in doc.select(&root) {
        for section in container.select(&label) {
            for img in section.select(&image) {
                let src = img.value().attr("src").unwrap_or("").trim();
                if src.is_empty() || src.starts_with("data:") {
                    continue;
                }
                let alt = img.value().attr("alt").unwrap_or("").trim();
                let alt_matches = class_re.is_match(alt)
                    || alt.to_lowercase().contains("energy");
                let container_matches = alt.is_empty()
                    && collect_text(&section)
                        .split_whitespace()
                        .any(|tok| class_re.is_match(tok));
                if alt_matches || container_matches {
                    diagnostics.label_images += 1;
                    found = true;
                }
            }
        }
    }
    found
}

/// A badge is real when it is wired as a popover trigger with a payload;
/// a badge carrying the class without the trigger is the text-only fake.
fn badge_is_real(badge: &ElementRef<'_>) -> bool {
    badge.value().attr("data-action") == Some("a-popover")
        && !badge
            .value()
            .attr("data-a-popover")
            .unwrap_or("")
            .trim()
            .is_empty()
}

/// Predicate 3: mouseover label (popover badge).
///
/// Strict path: `div.energy-efficiency-label` →
/// `span.energy-badge[data-action="a-popover"]` with a non-empty popover
/// payload. A loose fallback accepts a real badge anywhere in the
/// document, but the text-only fake badge (same class, no popover wiring)
/// is explicitly excluded and never satisfies either path.
fn check_mouseover_label(doc: &Html, diagnostics: &mut Diagnostics) -> bool {
    let label = sel("div.energy-efficiency-label");
    let badge = sel("span.energy-badge");

    let mut found = false;
    for section in doc.select(&label) {
        for b in section.select(&badge) {
            if badge_is_real(&b) {
                diagnostics.popover_badges += 1;
                found = true;
            } else {
                diagnostics.fake_badges += 1;
            }
        }
    }
    if found {
        return true;
    }

    // Loose fallback, still subject to the fake-badge exclusion. Badges
    // already counted above sit inside the label container, so only look
    // at the rest of the document.
    for b in doc.select(&badge) {
        let inside_label = b.ancestors().filter_map(ElementRef::wrap).any(|el| {
            el.value()
                .attr("class")
                .is_some_and(|c| c.split_whitespace().any(|c| c == "energy-efficiency-label"))
        });
        if inside_label {
            continue;
        }
        if badge_is_real(&b) {
            diagnostics.popover_badges += 1;
            found = true;
        } else {
            diagnostics.fake_badges += 1;
        }
    }
    found
}
