//! Composes the diagram and its results table into one exportable JPEG.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, DynamicImage, Rgba, RgbaImage};
use serde_json::json;

use crate::acquire::UploadedImage;
use crate::config::{ReportConfig, SummaryMode};
use crate::error::{AppError, Result};
use crate::fsutil::{abs_path, default_sidecar_for, ensure_parent_dir, write_json_pretty};
use crate::table::ResultTable;
use crate::text::TextPainter;

pub const MIN_WIDTH: u32 = 800;
pub const PADDING: u32 = 40;
pub const HEADER_HEIGHT: u32 = 100;
pub const ROW_HEIGHT: u32 = 60;
pub const FOOTER_HEIGHT: u32 = 80;

/// Pixel sizes of the title and table text.
const TITLE_PX: u32 = 32;
const TEXT_PX: u32 = 24;
/// Distance from the bottom of the image to the title baseline.
const TITLE_BASELINE: u32 = 60;
/// Distance from the top of a table row to its text baseline.
const ROW_BASELINE: u32 = 40;
const CELL_INSET: u32 = 20;

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);
const FOREST: Rgba<u8> = Rgba([0x2D, 0x5A, 0x27, 255]);
const HEADER_FILL: Rgba<u8> = Rgba([0xF0, 0xF0, 0xF0, 255]);
const STRIPE_FILL: Rgba<u8> = Rgba([0xF9, 0xF9, 0xF9, 255]);
const ROW_TEXT: Rgba<u8> = Rgba([0x33, 0x33, 0x33, 255]);
const RULE: Rgba<u8> = Rgba([0xE0, 0xE0, 0xE0, 255]);

/// Canvas geometry for one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportLayout {
    pub width: u32,
    pub height: u32,
    pub image_x: u32,
    pub image_y: u32,
    pub title_baseline: u32,
    pub table_top: u32,
    pub summary_top: u32,
}

pub fn layout(image_width: u32, image_height: u32, rows: usize) -> ReportLayout {
    let rows = rows as u32;
    let width = image_width.max(MIN_WIDTH);
    let table_height = (rows + 1) * ROW_HEIGHT + FOOTER_HEIGHT;
    let table_top = image_height + PADDING + HEADER_HEIGHT;
    ReportLayout {
        width,
        height: image_height + table_height + PADDING * 3,
        image_x: (width - image_width) / 2,
        image_y: PADDING,
        title_baseline: image_height + PADDING + TITLE_BASELINE,
        table_top,
        summary_top: table_top + (rows + 1) * ROW_HEIGHT,
    }
}

/// Fixed strings drawn around the table rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Captions {
    pub title: &'static str,
    pub item: &'static str,
    pub ratio: &'static str,
    pub total: &'static str,
}

pub const KOREAN_CAPTIONS: Captions = Captions {
    title: "도시산림 개황모식도 분석 결과",
    item: "항목명",
    ratio: "비율 (%)",
    total: "합계",
};

/// Used with the bitmap font, which has no Hangul glyphs.
pub const LATIN_CAPTIONS: Captions = Captions {
    title: "Urban Forest Plot Analysis",
    item: "Item",
    ratio: "Ratio (%)",
    total: "Total",
};

pub fn captions_for(painter: &TextPainter) -> Captions {
    if painter.is_outline() {
        KOREAN_CAPTIONS
    } else {
        LATIN_CAPTIONS
    }
}

/// Title drawn for `style`: the configured override, else the painter's default.
pub fn title_for<'a>(style: &'a ReportConfig, painter: &TextPainter) -> &'a str {
    style
        .title
        .as_deref()
        .unwrap_or_else(|| captions_for(painter).title)
}

/// Draw `image` above the current rows of `table`, loading `style.font` if set.
pub fn compose(
    image: Option<&UploadedImage>,
    table: &ResultTable,
    style: &ReportConfig,
) -> Result<RgbaImage> {
    let image = image.ok_or(AppError::NoImage)?;
    let painter = TextPainter::load(style.font.as_deref())?;
    Ok(compose_with(image, table, style, &painter))
}

/// Labels come from the table as edited; percentages are the rendered texts.
pub fn compose_with(
    image: &UploadedImage,
    table: &ResultTable,
    style: &ReportConfig,
    painter: &TextPainter,
) -> RgbaImage {
    let geo = layout(image.width(), image.height(), table.len());
    let captions = captions_for(painter);

    let mut canvas = RgbaImage::from_pixel(geo.width, geo.height, WHITE);
    imageops::overlay(
        &mut canvas,
        image.pixels(),
        i64::from(geo.image_x),
        i64::from(geo.image_y),
    );

    let title = title_for(style, painter);
    let title_x = painter.centered_x(geo.width, title, TITLE_PX);
    painter.draw(&mut canvas, title_x, geo.title_baseline as i32, title, FOREST, TITLE_PX, true);

    let left = PADDING;
    let right = geo.width - PADDING;
    let col1_x = (left + CELL_INSET) as i32;
    let col2_x = (right - CELL_INSET) as i32;

    let mut y = geo.table_top;
    fill_rect(&mut canvas, left, y, right, y + ROW_HEIGHT, HEADER_FILL);
    let baseline = (y + ROW_BASELINE) as i32;
    painter.draw(&mut canvas, col1_x, baseline, captions.item, BLACK, TEXT_PX, true);
    painter.draw_right(&mut canvas, col2_x, baseline, captions.ratio, BLACK, TEXT_PX, true);
    y += ROW_HEIGHT;

    for (index, row) in table.rows().iter().enumerate() {
        if index % 2 == 1 {
            fill_rect(&mut canvas, left, y, right, y + ROW_HEIGHT, STRIPE_FILL);
        }
        let baseline = (y + ROW_BASELINE) as i32;
        painter.draw(&mut canvas, col1_x, baseline, &row.label, ROW_TEXT, TEXT_PX, false);
        painter.draw_right(&mut canvas, col2_x, baseline, &row.percent_text, ROW_TEXT, TEXT_PX, false);
        draw_hline(&mut canvas, left, right, y + ROW_HEIGHT - 1, RULE);
        y += ROW_HEIGHT;
    }

    let summary = match style.summary {
        SummaryMode::Computed => table.total_text(),
        SummaryMode::Literal => "100%".to_string(),
    };
    fill_rect(&mut canvas, left, y, right, y + ROW_HEIGHT, FOREST);
    let baseline = (y + ROW_BASELINE) as i32;
    painter.draw(&mut canvas, col1_x, baseline, captions.total, WHITE, TEXT_PX, true);
    painter.draw_right(&mut canvas, col2_x, baseline, &summary, WHITE, TEXT_PX, true);

    canvas
}

pub fn encode_jpeg(canvas: &RgbaImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = DynamicImage::ImageRgba8(canvas.clone()).to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode_image(&rgb)?;
    Ok(out)
}

pub fn report_file_name(unix_millis: i64) -> String {
    format!("analysis_result_{unix_millis}.jpg")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedReport {
    pub image_path: PathBuf,
    pub sidecar_path: Option<PathBuf>,
}

/// Compose, encode and write the report into `out_dir`.
pub fn download(
    image: Option<&UploadedImage>,
    table: &ResultTable,
    style: &ReportConfig,
    out_dir: &Path,
) -> Result<ExportedReport> {
    let image = image.ok_or(AppError::NoImage)?;
    let painter = TextPainter::load(style.font.as_deref())?;
    let canvas = compose_with(image, table, style, &painter);
    let jpeg = encode_jpeg(&canvas, style.quality)?;

    let now = Utc::now();
    let image_path = out_dir.join(report_file_name(now.timestamp_millis()));
    ensure_parent_dir(&image_path)?;
    fs::write(&image_path, &jpeg)?;
    tracing::info!(
        path = %image_path.display(),
        bytes = jpeg.len(),
        width = canvas.width(),
        height = canvas.height(),
        "report written"
    );

    let sidecar_path = if style.sidecar {
        let path = default_sidecar_for(&image_path);
        let sidecar = json!({
            "generated_at": now.to_rfc3339(),
            "image_path": abs_path(&image_path).display().to_string(),
            "source_image": abs_path(image.source()).display().to_string(),
            "title": title_for(style, &painter),
            "font": style.font.as_ref().map(|p| abs_path(p).display().to_string()),
            "rows": table.rows(),
            "total": table.total(),
            "total_text": table.total_text(),
            "total_state": table.total_state(),
            "summary_mode": style.summary,
        });
        write_json_pretty(&path, &sidecar)?;
        Some(path)
    } else {
        None
    };

    Ok(ExportedReport {
        image_path,
        sidecar_path,
    })
}

// --- Drawing helpers ---

/// Fill `[x0, x1) x [y0, y1)`, clipped to the canvas.
fn fill_rect(img: &mut RgbaImage, x0: u32, y0: u32, x1: u32, y1: u32, color: Rgba<u8>) {
    for y in y0..y1.min(img.height()) {
        for x in x0..x1.min(img.width()) {
            img.put_pixel(x, y, color);
        }
    }
}

fn draw_hline(img: &mut RgbaImage, x0: u32, x1: u32, y: u32, color: Rgba<u8>) {
    if y >= img.height() {
        return;
    }
    for x in x0..=x1.min(img.width().saturating_sub(1)) {
        img.put_pixel(x, y, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::test_support::uploaded;
    use crate::inference::{CoverageItem, CoverageReport};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn table(items: &[(&str, u32)]) -> ResultTable {
        ResultTable::render(&CoverageReport {
            items: items
                .iter()
                .map(|(label, pct)| CoverageItem::new(*label, *pct))
                .collect(),
        })
    }

    #[test]
    fn layout_for_wide_image_and_three_rows() {
        let geo = layout(900, 600, 3);
        assert_eq!(geo.width, 900);
        // 600 + (3 + 1) * 60 + 80 + 3 * 40
        assert_eq!(geo.height, 1040);
        assert_eq!(geo.image_x, 0);
        assert_eq!(geo.table_top, 740);
        assert_eq!(geo.summary_top, 980);
        assert_eq!(geo.summary_top + ROW_HEIGHT, geo.height);
    }

    #[test]
    fn narrow_images_are_centered_on_minimum_width() {
        let geo = layout(300, 200, 0);
        assert_eq!(geo.width, MIN_WIDTH);
        assert_eq!(geo.image_x, 250);
        assert_eq!(geo.height, 200 + 60 + 80 + 120);
    }

    #[test]
    fn compose_without_image_is_an_error() {
        let err = compose(None, &table(&[("lawn", 100)]), &ReportConfig::default()).unwrap_err();
        assert!(matches!(err, AppError::NoImage));
    }

    #[test]
    fn compose_paints_image_table_and_summary() {
        let image = uploaded(100, 50);
        let canvas = compose(
            Some(&image),
            &table(&[("lawn", 60), ("clover", 40)]),
            &ReportConfig::default(),
        )
        .unwrap();
        let geo = layout(100, 50, 2);
        assert_eq!((canvas.width(), canvas.height()), (geo.width, geo.height));

        assert_eq!(*canvas.get_pixel(0, 0), WHITE);
        let painted = canvas.get_pixel(geo.image_x + 10, geo.image_y + 10).0;
        let source = image.pixels().get_pixel(10, 10).0;
        assert!(painted.iter().zip(source).all(|(a, b)| a.abs_diff(b) <= 1));
        assert_eq!(*canvas.get_pixel(PADDING + 1, geo.table_top + 1), HEADER_FILL);
        // second data row is striped
        assert_eq!(
            *canvas.get_pixel(PADDING + 1, geo.table_top + 2 * ROW_HEIGHT + 1),
            STRIPE_FILL
        );
        assert_eq!(*canvas.get_pixel(PADDING + 1, geo.table_top + 2 * ROW_HEIGHT - 1), RULE);
        assert_eq!(*canvas.get_pixel(PADDING + 1, geo.summary_top + 1), FOREST);
    }

    #[test]
    fn edited_labels_change_the_rendered_rows() {
        let image = uploaded(100, 50);
        let style = ReportConfig::default();
        let original = table(&[("lawn", 100)]);
        let mut edited = original.clone();
        edited.set_label(0, "paving").unwrap();

        let a = compose(Some(&image), &original, &style).unwrap();
        let b = compose(Some(&image), &edited, &style).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn summary_mode_controls_total_text() {
        let image = uploaded(100, 50);
        let short = table(&[("lawn", 50), ("paving", 40)]);
        let computed = compose(Some(&image), &short, &ReportConfig::default()).unwrap();
        let literal = compose(
            Some(&image),
            &short,
            &ReportConfig {
                summary: SummaryMode::Literal,
                ..ReportConfig::default()
            },
        )
        .unwrap();
        assert_ne!(computed, literal);

        let exact = table(&[("lawn", 100)]);
        let computed = compose(Some(&image), &exact, &ReportConfig::default()).unwrap();
        let literal = compose(
            Some(&image),
            &exact,
            &ReportConfig {
                summary: SummaryMode::Literal,
                ..ReportConfig::default()
            },
        )
        .unwrap();
        assert_eq!(computed, literal);
    }

    #[test]
    fn hangul_label_edits_change_the_bitmap_report() {
        let image = uploaded(100, 50);
        let style = ReportConfig::default();
        let original = table(&[("잔디", 60), ("토끼풀", 40)]);
        let mut edited = original.clone();
        edited.set_label(0, "포장").unwrap();

        let a = compose(Some(&image), &original, &style).unwrap();
        let b = compose(Some(&image), &edited, &style).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn captions_follow_the_painter() {
        assert_eq!(captions_for(&TextPainter::Bitmap), LATIN_CAPTIONS);
        let style = ReportConfig::default();
        assert_eq!(title_for(&style, &TextPainter::Bitmap), "Urban Forest Plot Analysis");

        let custom = ReportConfig {
            title: Some("Plot 7".to_string()),
            ..ReportConfig::default()
        };
        assert_eq!(title_for(&custom, &TextPainter::Bitmap), "Plot 7");
    }

    #[test]
    fn configured_font_that_cannot_load_fails_compose() {
        let dir = tempdir().unwrap();
        let style = ReportConfig {
            font: Some(dir.path().join("NotoSansKR-Regular.otf")),
            ..ReportConfig::default()
        };
        let err = compose(Some(&uploaded(10, 10)), &table(&[("lawn", 100)]), &style).unwrap_err();
        assert!(matches!(err, AppError::Font { .. }));
    }

    #[test]
    fn download_writes_jpeg_and_sidecar() {
        let dir = tempdir().unwrap();
        let image = uploaded(120, 80);
        let rows = table(&[("잔디", 60), ("토끼풀", 40)]);

        let exported =
            download(Some(&image), &rows, &ReportConfig::default(), dir.path()).unwrap();

        let name = exported
            .image_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap()
            .to_string();
        let millis = name
            .strip_prefix("analysis_result_")
            .and_then(|rest| rest.strip_suffix(".jpg"))
            .unwrap();
        assert!(!millis.is_empty() && millis.chars().all(|c| c.is_ascii_digit()));

        let bytes = fs::read(&exported.image_path).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), image::ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), MIN_WIDTH);

        let sidecar: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(exported.sidecar_path.unwrap()).unwrap())
                .unwrap();
        assert_eq!(sidecar["rows"][0]["label"], "잔디");
        assert_eq!(sidecar["total_text"], "100%");
        assert_eq!(sidecar["total_state"], "normal");
    }

    #[test]
    fn sidecar_can_be_disabled() {
        let dir = tempdir().unwrap();
        let style = ReportConfig {
            sidecar: false,
            ..ReportConfig::default()
        };
        let exported = download(Some(&uploaded(10, 10)), &table(&[]), &style, dir.path()).unwrap();
        assert_eq!(exported.sidecar_path, None);
        assert!(exported.image_path.exists());
    }
}
