//! Plotly-график NDVI: история, сглаживание, пики, прогноз и предсказанные пики.

use itertools::Itertools;
use plotly::color::Rgb;
use plotly::common::{Anchor, DashType, Font, Line, Marker, MarkerSymbol, Mode, Orientation, Title};
use plotly::layout::{Axis, Layout, Legend, Margin};
use plotly::{Configuration, Plot, Scatter};

use crate::constants::DATE_FORMAT;
use crate::pipeline::BloomResult;

const LABEL_RAW: &str = "Raw NDVI";
const LABEL_SMOOTH: &str = "Smoothed NDVI";
const LABEL_BLOOMS: &str = "Detected Blooms";
const LABEL_FORECAST: &str = "Forecast";
const LABEL_PREDICTED: &str = "Predicted Blooms";
const AXIS_TITLE_X: &str = "Date";
const AXIS_TITLE_Y: &str = "NDVI";
const FONT_FAMILY: &str = "IBM Plex Sans, PT Sans, Arial, sans-serif";
const FONT_SIZE_BASE: usize = 12;
const PLOT_HEIGHT: usize = 500;
const LINE_WIDTH_RAW: f64 = 1.0;
const LINE_WIDTH_SMOOTH: f64 = 2.0;
const LINE_WIDTH_FORECAST: f64 = 2.0;
const MARKER_SIZE: usize = 10;
const MARKER_EDGE_WIDTH: f64 = 1.5;
const RAW_OPACITY: f64 = 0.6;
const LEGEND_X: f64 = 1.0;
const LEGEND_Y: f64 = 1.02;
const MARGIN_LEFT: usize = 60;
const MARGIN_RIGHT: usize = 30;
const MARGIN_TOP: usize = 80;
const MARGIN_BOTTOM: usize = 50;
const COLOR_RAW: (u8, u8, u8) = (144, 238, 144);
const COLOR_SMOOTH: (u8, u8, u8) = (0, 128, 0);
const COLOR_BLOOM: (u8, u8, u8) = (255, 0, 0);
const COLOR_FORECAST: (u8, u8, u8) = (0, 0, 255);
const COLOR_PREDICTED: (u8, u8, u8) = (255, 165, 0);
const COLOR_MARKER_EDGE: (u8, u8, u8) = (255, 255, 255);
const COLOR_TEXT_BASE: (u8, u8, u8) = (40, 40, 40);

fn rgb(color: (u8, u8, u8)) -> Rgb {
    Rgb::new(color.0, color.1, color.2)
}

/// Пропуски (NaN) уходят в `null`, Plotly рисует на их месте разрыв линии.
fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

fn marker(color: (u8, u8, u8), symbol: MarkerSymbol) -> Marker {
    Marker::new()
        .color(rgb(color))
        .size(MARKER_SIZE)
        .symbol(symbol)
        .line(
            Line::new()
                .color(rgb(COLOR_MARKER_EDGE))
                .width(MARKER_EDGE_WIDTH),
        )
}

pub(super) fn chart_title(region: &str) -> String {
    format!("NDVI Timeline for {region}")
}

pub(super) fn build_bloom_chart(region: &str, result: &BloomResult) -> Plot {
    let dates = result
        .history
        .iter()
        .map(|point| point.date.format(DATE_FORMAT).to_string())
        .collect_vec();
    let raw = result
        .history
        .iter()
        .map(|point| finite(point.ndvi))
        .collect_vec();
    let smoothed = result
        .history
        .iter()
        .map(|point| point.ndvi_smooth)
        .collect_vec();

    let mut plot = Plot::new();
    plot.add_trace(
        Scatter::new(dates.clone(), raw)
            .mode(Mode::Lines)
            .name(LABEL_RAW)
            .opacity(RAW_OPACITY)
            .line(Line::new().color(rgb(COLOR_RAW)).width(LINE_WIDTH_RAW)),
    );
    plot.add_trace(
        Scatter::new(dates, smoothed)
            .mode(Mode::Lines)
            .name(LABEL_SMOOTH)
            .line(Line::new().color(rgb(COLOR_SMOOTH)).width(LINE_WIDTH_SMOOTH)),
    );

    if !result.peaks.is_empty() {
        let (peak_dates, peak_values): (Vec<_>, Vec<_>) = result
            .peaks
            .iter()
            .map(|peak| (peak.date.format(DATE_FORMAT).to_string(), peak.value))
            .unzip();
        plot.add_trace(
            Scatter::new(peak_dates, peak_values)
                .mode(Mode::Markers)
                .name(LABEL_BLOOMS)
                .marker(marker(COLOR_BLOOM, MarkerSymbol::Star)),
        );
    }

    if let Some(outlook) = result.forecast()
        && !outlook.forecast.is_empty()
    {
        let (forecast_dates, forecast_values): (Vec<_>, Vec<_>) = outlook
            .forecast
            .points
            .iter()
            .map(|point| (point.date.format(DATE_FORMAT).to_string(), point.yhat))
            .unzip();
        plot.add_trace(
            Scatter::new(forecast_dates, forecast_values)
                .mode(Mode::Lines)
                .name(LABEL_FORECAST)
                .line(
                    Line::new()
                        .color(rgb(COLOR_FORECAST))
                        .width(LINE_WIDTH_FORECAST)
                        .dash(DashType::Dash),
                ),
        );

        if !outlook.future_peaks.is_empty() {
            let (peak_dates, peak_values): (Vec<_>, Vec<_>) = outlook
                .future_peaks
                .iter()
                .map(|peak| (peak.date.format(DATE_FORMAT).to_string(), peak.value))
                .unzip();
            plot.add_trace(
                Scatter::new(peak_dates, peak_values)
                    .mode(Mode::Markers)
                    .name(LABEL_PREDICTED)
                    .marker(marker(COLOR_PREDICTED, MarkerSymbol::Circle)),
            );
        }
    }

    let layout = Layout::new()
        .title(Title::with_text(chart_title(region)))
        .font(
            Font::new()
                .family(FONT_FAMILY)
                .size(FONT_SIZE_BASE)
                .color(rgb(COLOR_TEXT_BASE)),
        )
        .height(PLOT_HEIGHT)
        .auto_size(true)
        .margin(
            Margin::new()
                .left(MARGIN_LEFT)
                .right(MARGIN_RIGHT)
                .top(MARGIN_TOP)
                .bottom(MARGIN_BOTTOM),
        )
        .show_legend(true)
        .legend(
            Legend::new()
                .orientation(Orientation::Horizontal)
                .x(LEGEND_X)
                .x_anchor(Anchor::Right)
                .y(LEGEND_Y)
                .y_anchor(Anchor::Bottom),
        )
        .x_axis(Axis::new().title(Title::with_text(AXIS_TITLE_X)))
        .y_axis(Axis::new().title(Title::with_text(AXIS_TITLE_Y)));

    plot.set_layout(layout);
    plot.set_configuration(Configuration::new().responsive(true));
    plot
}
