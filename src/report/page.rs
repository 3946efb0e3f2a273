//! Рендер HTML-страницы региона. Блоки общие, раскладка задаётся [`PageLayout`].

use chrono::{DateTime, Utc};
use maud::{DOCTYPE, Markup, PreEscaped, html};
use plotly::Plot;

use super::{PageLayout, RegionReport, report_file_name};
use crate::constants::{EXPORT_DATE_FORMAT, FUTURE_PEAKS_SHOWN};
use crate::pipeline::Outlook;

const PAGE_TITLE: &str = "🌸 BloomWatch – Multi-Region NDVI";
const PAGE_SUBTITLE: &str = "Track and predict blooming events using satellite-based NDVI data.";
const PAGE_CAPTION: &str = "Sample NDVI series are synthetic. Any regional CSV with date and ndvi columns can be plugged in.";
const FAVICON_DATA_URI: &str = "data:image/svg+xml,%3Csvg%20xmlns='http://www.w3.org/2000/svg'%20viewBox='0%200%2064%2064'%3E%3Crect%20width='64'%20height='64'%20rx='14'%20fill='%23238443'/%3E%3Ctext%20x='32'%20y='42'%20font-size='30'%20text-anchor='middle'%20fill='white'%3EB%3C/text%3E%3C/svg%3E";
const GENERATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M UTC";
const GOOGLE_FONTS_CSS: &str =
    "https://fonts.googleapis.com/css2?family=IBM+Plex+Sans:wght@400;500;600&display=swap";
const PLOTLY_CDN: &str = "https://cdn.plot.ly/plotly-2.35.2.min.js";
const OSM_BASE: &str = "https://www.openstreetmap.org/";
const OSM_ZOOM: u8 = 9;
const PLOT_ID: &str = "ndvi-plot";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const STYLE: &str = "
:root {
    color-scheme: light;
    --bg: #f5f7f2;
    --card: #ffffff;
    --ink: #1f2a24;
    --muted: #5a665e;
    --accent: #238443;
    --warn: #b26a00;
    --border: rgba(31, 42, 36, 0.08);
}
* { box-sizing: border-box; }
body {
    margin: 0;
    background: var(--bg);
    color: var(--ink);
    font-family: \"IBM Plex Sans\", \"PT Sans\", sans-serif;
}
.page { max-width: 1240px; margin: 36px auto 60px; padding: 0 24px; }
.title { font-size: 26px; font-weight: 600; margin: 0; }
.subtitle { margin: 6px 0 0; color: var(--muted); font-size: 13px; }
.region-nav { display: flex; flex-wrap: wrap; gap: 8px; margin: 18px 0; }
.region-nav a {
    padding: 6px 12px;
    border-radius: 999px;
    border: 1px solid rgba(35, 132, 67, 0.25);
    color: var(--accent);
    text-decoration: none;
    font-size: 13px;
}
.region-nav a.current { background: var(--accent); color: #fff; }
.card {
    background: var(--card);
    border-radius: 18px;
    padding: 16px 20px;
    border: 1px solid var(--border);
    margin-bottom: 16px;
    overflow-x: auto;
}
.card h2 { margin: 0 0 10px; font-size: 16px; font-weight: 600; }
.notice { padding: 10px 14px; border-radius: 12px; font-size: 13px; margin: 8px 0; }
.notice.ok { background: rgba(35, 132, 67, 0.08); color: var(--accent); }
.notice.warn { background: rgba(178, 106, 0, 0.1); color: var(--warn); }
.notice.info { background: rgba(36, 100, 166, 0.08); color: #2464a6; }
.data-table { width: 100%; border-collapse: collapse; font-size: 13px; }
.data-table th, .data-table td {
    padding: 8px 10px;
    border-bottom: 1px solid var(--border);
    text-align: left;
}
.data-table th {
    color: var(--muted);
    font-weight: 500;
    text-transform: uppercase;
    font-size: 11px;
    letter-spacing: 0.02em;
}
.download {
    display: inline-flex;
    padding: 8px 14px;
    border-radius: 999px;
    background: var(--accent);
    color: #fff;
    text-decoration: none;
    font-weight: 500;
}
.tab-bar { display: flex; gap: 6px; margin-bottom: 12px; flex-wrap: wrap; }
.tab-bar button {
    font: inherit;
    padding: 8px 14px;
    border-radius: 10px;
    border: 1px solid var(--border);
    background: #fff;
    cursor: pointer;
}
.tab-bar button.active { background: var(--accent); color: #fff; }
.tab-panel { display: none; }
.tab-panel.active { display: block; }
details.card > summary { cursor: pointer; font-weight: 600; font-size: 15px; }
details.card[open] > summary { margin-bottom: 10px; }
.with-sidebar { display: grid; grid-template-columns: 300px minmax(0, 1fr); gap: 18px; }
.with-sidebar aside .region-nav { flex-direction: column; }
#ndvi-plot { width: 100%; min-height: 500px; }
footer { margin-top: 16px; font-size: 12px; color: var(--muted); text-align: right; }
@media (max-width: 900px) {
    .title { font-size: 22px; }
    .with-sidebar { grid-template-columns: 1fr; }
}
";

const TABS_SCRIPT: &str = r"
(() => {
    const buttons = Array.from(document.querySelectorAll('.tab-bar button'));
    const panels = Array.from(document.querySelectorAll('.tab-panel'));
    buttons.forEach(button => button.addEventListener('click', () => {
        buttons.forEach(b => b.classList.toggle('active', b === button));
        panels.forEach(p => p.classList.toggle('active', p.id === button.dataset.tab));
        if (window.Plotly) {
            const plot = document.getElementById('ndvi-plot');
            if (plot) window.Plotly.Plots.resize(plot);
        }
    }));
})();
";

/// Блок страницы: заголовок, якорь и уже отрендеренное содержимое.
struct Block {
    id: &'static str,
    title: &'static str,
    body: Markup,
}

pub(super) fn render_page(
    report: &RegionReport<'_>,
    plot: &Plot,
    layout: PageLayout,
    generated_at: DateTime<Utc>,
) -> String {
    let generated_label = generated_at.format(GENERATED_AT_FORMAT).to_string();
    let page_title = format!("BloomWatch · {}", report.region);
    let blocks = [
        Block {
            id: "timeline",
            title: "NDVI Timeline",
            body: html! { (PreEscaped(plot.to_inline_html(Some(PLOT_ID)))) },
        },
        Block {
            id: "past-blooms",
            title: "Past Bloom Events",
            body: past_blooms(report),
        },
        Block {
            id: "future-blooms",
            title: "Predicted Future Blooms",
            body: future_blooms(report),
        },
        Block {
            id: "export",
            title: "Export Results",
            body: export_block(report),
        },
        Block {
            id: "map",
            title: "Map of the Region",
            body: map_block(report),
        },
    ];

    let content = match layout {
        PageLayout::Tabs => tabs_layout(&blocks),
        PageLayout::Expanders => expanders_layout(&blocks),
        PageLayout::Sidebar => sidebar_layout(report, &blocks),
    };

    let page = html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1";
                meta name="description" content=(PAGE_SUBTITLE);
                link rel="icon" type="image/svg+xml" href=(FAVICON_DATA_URI);
                title { (page_title) }
                link rel="preconnect" href="https://fonts.googleapis.com";
                link rel="preconnect" href="https://fonts.gstatic.com" crossorigin;
                link rel="stylesheet" href=(GOOGLE_FONTS_CSS);
                script src=(PLOTLY_CDN) {}
                style { (PreEscaped(STYLE)) }
            }
            body {
                div class="page" {
                    header {
                        h1 class="title" { (PAGE_TITLE) }
                        p class="subtitle" { (PAGE_SUBTITLE) }
                    }
                    @if layout != PageLayout::Sidebar {
                        (region_nav(report))
                    }
                    div class="notice ok" {
                        "NDVI dataset for " strong { (report.region) } " loaded successfully ("
                        (report.result.history.len()) " observations)."
                    }
                    (content)
                    footer {
                        (PAGE_CAPTION) br;
                        "Version: " (APP_VERSION) " · Generated: " (generated_label)
                    }
                }
            }
        }
    };
    page.into_string()
}

fn region_nav(report: &RegionReport<'_>) -> Markup {
    html! {
        nav class="region-nav" aria-label="Regions" {
            @for name in report.regions {
                @let current = name.eq_ignore_ascii_case(report.region);
                a class=[current.then_some("current")] href=(report_file_name(name)) {
                    "📍 " (name)
                }
            }
        }
    }
}

fn past_blooms(report: &RegionReport<'_>) -> Markup {
    let peaks = &report.result.peaks;
    html! {
        @if peaks.is_empty() {
            div class="notice warn" { "⚠️ No bloom events detected in historical data." }
        } @else {
            div class="notice ok" {
                "🌸 Found " (peaks.len()) " past bloom events in " (report.region)
            }
            table class="data-table" {
                thead { tr { th { "Bloom Date" } th { "NDVI Value" } } }
                tbody {
                    @for peak in peaks {
                        tr {
                            td { (peak.date.format(EXPORT_DATE_FORMAT).to_string()) }
                            td { (format_ndvi(peak.value)) }
                        }
                    }
                }
            }
        }
    }
}

fn future_blooms(report: &RegionReport<'_>) -> Markup {
    html! {
        @match &report.result.outlook {
            Outlook::Unavailable { reason } => {
                div class="notice warn" { "⚠️ Forecast is not available: " (reason) }
            }
            Outlook::Available(outlook) => {
                @if outlook.future_peaks.is_empty() {
                    div class="notice warn" { "⚠️ No future bloom predicted." }
                } @else {
                    div class="notice ok" { "🔮 Predicted future bloom events:" }
                    table class="data-table" {
                        thead { tr { th { "Predicted Date" } th { "Forecasted NDVI" } } }
                        tbody {
                            @for peak in outlook.future_peaks.iter().take(FUTURE_PEAKS_SHOWN) {
                                tr {
                                    td { (peak.date.format(EXPORT_DATE_FORMAT).to_string()) }
                                    td { (format_ndvi(peak.value)) }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn export_block(report: &RegionReport<'_>) -> Markup {
    html! {
        @if let Some(name) = &report.download_name {
            a class="download" href=(name) download { "💾 Download Processed Data" }
            p class="subtitle" { "Columns: date, ndvi, ndvi_smooth, is_peak." }
        } @else {
            div class="notice info" { "Processed data was not exported for this run." }
        }
    }
}

fn map_block(report: &RegionReport<'_>) -> Markup {
    let centroid = report.centroid();
    html! {
        @if let Some(center) = centroid {
            p {
                (report.coordinates.len()) " located observations, centred at "
                (format!("{:.4}, {:.4}", center.lat, center.lon))
            }
            a class="download"
                href=(format!("{OSM_BASE}?mlat={lat:.5}&mlon={lon:.5}#map={OSM_ZOOM}/{lat:.5}/{lon:.5}", lat = center.lat, lon = center.lon))
                target="_blank"
                rel="noopener" {
                "🗺️ Open on OpenStreetMap"
            }
        } @else {
            div class="notice info" {
                "📍 Latitude and longitude data not available for this region's map."
            }
        }
    }
}

fn tabs_layout(blocks: &[Block]) -> Markup {
    html! {
        div class="tab-bar" role="tablist" {
            @for (idx, block) in blocks.iter().enumerate() {
                button type="button" role="tab" class=[(idx == 0).then_some("active")] data-tab=(block.id) {
                    (block.title)
                }
            }
        }
        @for (idx, block) in blocks.iter().enumerate() {
            section id=(block.id) class=(panel_class(idx == 0)) role="tabpanel" {
                h2 { (block.title) }
                (block.body)
            }
        }
        script { (PreEscaped(TABS_SCRIPT)) }
    }
}

fn expanders_layout(blocks: &[Block]) -> Markup {
    html! {
        @for (idx, block) in blocks.iter().enumerate() {
            details id=(block.id) class="card" open[idx == 0] {
                summary { (block.title) }
                (block.body)
            }
        }
    }
}

/// Навигация, экспорт и карта уходят в боковую колонку; график и таблицы остаются в основной.
fn sidebar_layout(report: &RegionReport<'_>, blocks: &[Block]) -> Markup {
    let in_sidebar = |block: &Block| matches!(block.id, "export" | "map");
    html! {
        div class="with-sidebar" {
            aside {
                div class="card" {
                    h2 { "📍 Select a Region" }
                    (region_nav(report))
                }
                @for block in blocks.iter().filter(|block| in_sidebar(block)) {
                    section id=(block.id) class="card" {
                        h2 { (block.title) }
                        (block.body)
                    }
                }
            }
            main {
                @for block in blocks.iter().filter(|block| !in_sidebar(block)) {
                    section id=(block.id) class="card" {
                        h2 { (block.title) }
                        (block.body)
                    }
                }
            }
        }
    }
}

const fn panel_class(active: bool) -> &'static str {
    if active { "card tab-panel active" } else { "card tab-panel" }
}

fn format_ndvi(value: f64) -> String {
    if value.is_finite() {
        format!("{value:.4}")
    } else {
        "—".to_string()
    }
}
