//! SVG charts over an [`Extraction`].
//!
//! Line colors come from a [`PaletteCursor`] that the caller threads through
//! every chart, so a color is never reused within one rendering pass.

use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use plotters::prelude::*;
use tracing::{debug, info};

use crate::extract::Extraction;
use crate::series::{Numeric, SessionSeries};

const SIZE: (u32, u32) = (1024, 768);

/// Walks `Palette99` in order, wrapping around at the end.
#[derive(Debug, Clone, Default)]
pub struct PaletteCursor {
    next: usize,
}

impl PaletteCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_color(&mut self) -> RGBColor {
        let (r, g, b) = Palette99::COLORS[self.next % Palette99::COLORS.len()];
        self.next += 1;
        RGBColor(r, g, b)
    }

    /// Colors handed out so far.
    pub fn used(&self) -> usize {
        self.next
    }
}

/// One labelled polyline.
pub struct Line {
    pub label: String,
    pub points: Vec<(f64, f64)>,
}

fn lines<T: Numeric>(series: &SessionSeries<T>, label: &str) -> Vec<Line> {
    series
        .iter()
        .map(|(session, s)| Line {
            label: format!("{label}{session}"),
            points: s.points().map(|(t, v)| (t as f64, v.to_f64())).collect(),
        })
        .collect()
}

fn span(lo: f64, hi: f64) -> Range<f64> {
    if hi > lo {
        lo..hi
    } else {
        lo - 1.0..hi + 1.0
    }
}

fn bounds<'a>(lines: impl IntoIterator<Item = &'a Line>) -> Option<(Range<f64>, Range<f64>)> {
    let mut it = lines.into_iter().flat_map(|l| l.points.iter().copied());
    let (x0, y0) = it.next()?;
    let (mut xl, mut xh, mut yl, mut yh) = (x0, x0, y0, y0);
    for (x, y) in it {
        xl = xl.min(x);
        xh = xh.max(x);
        yl = yl.min(y);
        yh = yh.max(y);
    }
    Some((span(xl, xh), span(yl.min(0.0), yh)))
}

/// Single-axis chart. Returns `false` without writing when there is no data.
pub fn line_chart(
    path: &Path,
    caption: &str,
    y_desc: &str,
    lines: &[Line],
    palette: &mut PaletteCursor,
) -> Result<bool> {
    let Some((xr, yr)) = bounds(lines) else {
        debug!(chart = caption, "no data, chart skipped");
        return Ok(false);
    };

    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(caption, ("sans-serif", 30).into_font())
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(xr, yr)?;

    chart
        .configure_mesh()
        .x_desc("tic")
        .y_desc(y_desc)
        .draw()?;

    for line in lines {
        let color = palette.next_color();
        chart
            .draw_series(LineSeries::new(line.points.iter().copied(), color))?
            .label(line.label.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()
        .with_context(|| format!("write {}", path.display()))?;
    Ok(true)
}

/// Chart with `left` on the primary axis and `right` on a secondary one.
pub fn dual_chart(
    path: &Path,
    caption: &str,
    (left_desc, left): (&str, &[Line]),
    (right_desc, right): (&str, &[Line]),
    palette: &mut PaletteCursor,
) -> Result<bool> {
    let Some((xl, yl)) = bounds(left) else {
        debug!(chart = caption, "no primary data, chart skipped");
        return Ok(false);
    };
    let (xr, yr) = bounds(right).unwrap_or((xl.clone(), 0.0..1.0));
    let x = span(xl.start.min(xr.start), xl.end.max(xr.end));

    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(caption, ("sans-serif", 30).into_font())
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .right_y_label_area_size(60)
        .build_cartesian_2d(x.clone(), yl)?
        .set_secondary_coord(x, yr);

    chart
        .configure_mesh()
        .x_desc("tic")
        .y_desc(left_desc)
        .draw()?;
    chart.configure_secondary_axes().y_desc(right_desc).draw()?;

    for line in left {
        let color = palette.next_color();
        chart
            .draw_series(LineSeries::new(line.points.iter().copied(), color))?
            .label(line.label.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }
    for line in right {
        let color = palette.next_color();
        chart
            .draw_secondary_series(LineSeries::new(line.points.iter().copied(), color))?
            .label(line.label.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()
        .with_context(|| format!("write {}", path.display()))?;
    Ok(true)
}

/// Renders every chart that has data into `out_dir` and returns the files
/// written.
pub fn render_all(x: &Extraction, out_dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("create {}", out_dir.display()))?;

    let rtt = lines(&x.rtt, "rtt");
    let loss = lines(&x.loss, "loss");
    let inflight = lines(&x.inflight, "inflight");
    let cwnd = lines(&x.cwnd, "cwnd");
    let delivery = lines(&x.delivery_rate, "delivery_rate");
    let btl_bw = lines(&x.btl_bw, "btlBw");
    let rtprop = lines(&x.rtprop, "RTprop");

    let mut palette = PaletteCursor::new();
    let mut written = Vec::new();
    let mut keep = |name: &str, drawn: bool| {
        if drawn {
            written.push(out_dir.join(name));
        }
    };

    keep(
        "rtt.svg",
        line_chart(&out_dir.join("rtt.svg"), "RTT", "rtt (us)", &rtt, &mut palette)?,
    );
    keep(
        "loss.svg",
        line_chart(&out_dir.join("loss.svg"), "Loss", "lost packets", &loss, &mut palette)?,
    );
    keep(
        "inflight.svg",
        line_chart(
            &out_dir.join("inflight.svg"),
            "In flight at loss detection",
            "packets",
            &inflight,
            &mut palette,
        )?,
    );
    keep(
        "cwnd.svg",
        line_chart(&out_dir.join("cwnd.svg"), "Congestion window", "cwnd", &cwnd, &mut palette)?,
    );

    let loss_and_cwnd: Vec<Line> = loss.into_iter().chain(cwnd).collect();
    keep(
        "rtt_loss_cwnd.svg",
        dual_chart(
            &out_dir.join("rtt_loss_cwnd.svg"),
            "RTT with loss and cwnd",
            ("rtt (us)", &rtt),
            ("loss / cwnd", &loss_and_cwnd),
            &mut palette,
        )?,
    );
    keep(
        "delivery.svg",
        dual_chart(
            &out_dir.join("delivery.svg"),
            "Delivery rate and bottleneck bandwidth",
            ("delivery rate", &delivery),
            ("btlBw", &btl_bw),
            &mut palette,
        )?,
    );
    keep(
        "rtprop.svg",
        line_chart(&out_dir.join("rtprop.svg"), "RTprop", "RTprop (us)", &rtprop, &mut palette)?,
    );

    info!(charts = written.len(), dir = %out_dir.display(), "charts written");
    Ok(written)
}
