//! HTML-отчёт по региону: Plotly-график и страница на maud.

mod chart;
mod page;

use std::error::Error;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use minify_html::{Cfg, minify};

use crate::pipeline::BloomResult;
use crate::series::{self, Coordinate};

const REPORT_PREFIX: &str = "bloomwatch_";
const REPORT_EXTENSION: &str = "html";

/// Раскладка страницы; блоки одинаковые, меняется только их расположение.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum PageLayout {
    /// Вкладки, по одной на блок.
    #[default]
    Tabs,
    /// Раскрывающиеся секции, открыт только график.
    Expanders,
    /// Боковая колонка с регионами, экспортом и картой.
    Sidebar,
}

/// Всё, что нужно странице одного региона.
pub struct RegionReport<'a> {
    pub region: &'a str,
    pub result: &'a BloomResult,
    pub coordinates: &'a [Coordinate],
    /// Имя файла выгрузки для ссылки скачивания (`None`, если CSV не писался).
    pub download_name: Option<String>,
    /// Все регионы для навигации между страницами.
    pub regions: &'a [String],
}

impl RegionReport<'_> {
    fn centroid(&self) -> Option<Coordinate> {
        series::centroid(self.coordinates)
    }
}

/// Имя HTML-файла региона; по нему же строятся ссылки навигации.
pub fn report_file_name(region: &str) -> String {
    format!(
        "{REPORT_PREFIX}{}.{REPORT_EXTENSION}",
        region.trim().to_lowercase()
    )
}

pub fn render_report(
    report: &RegionReport<'_>,
    layout: PageLayout,
    generated_at: DateTime<Utc>,
) -> String {
    let plot = chart::build_bloom_chart(report.region, report.result);
    page::render_page(report, &plot, layout, generated_at)
}

fn minify_page(page: &str) -> Vec<u8> {
    let cfg = Cfg {
        minify_css: true,
        minify_js: true,
        ..Cfg::default()
    };
    minify(page.as_bytes(), &cfg)
}

/// Рендерит и сохраняет страницу, создавая директорию при необходимости.
pub fn write_report(
    report: &RegionReport<'_>,
    output_html: &Path,
    layout: PageLayout,
    minify_html: bool,
) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = output_html.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let page = render_report(report, layout, Utc::now());
    if minify_html {
        fs::write(output_html, minify_page(&page))?;
    } else {
        fs::write(output_html, page)?;
    }
    Ok(())
}
