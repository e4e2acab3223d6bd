//! Invoice PDF rendering: a fixed top-to-bottom cursor layout on A4, built-in
//! Helvetica, sterling amounts at 2 decimal places. Same inputs, same pages.

use printpdf::{
    path::PaintMode, BuiltinFont, Color, Image, ImageTransform, IndirectFontRef, Mm, PdfDocument,
    PdfLayerReference, Rect, Rgb,
};

use crate::{Client, Invoice, LineItem, Settings};

const PAGE_W: f32 = 210.0;
const PAGE_H: f32 = 297.0;

const MARGIN_X: f32 = 15.0;
const COMPANY_RIGHT_X: f32 = 200.0;
const TABLE_W: f32 = 180.0;
const VALUE_RIGHT_X: f32 = 193.0;
// Cursor past this while emitting rows starts a fresh page.
const PAGE_BREAK_Y: f32 = 250.0;
const IMAGE_DPI: f32 = 300.0;

/// Per-row display total. Applies VAT before the discount multiplier, unlike the
/// stored aggregates in `compute_totals` which discount first; both renderings of
/// the arithmetic are kept as-is.
pub(crate) fn line_display_total(item: &LineItem) -> f64 {
    item.quantity * item.unit_price * (1.0 + item.vat_rate / 100.0) * (1.0 - item.discount / 100.0)
}

fn format_amount(v: f64) -> String {
    format!("£{:.2}", v)
}

/// Integral values print without a decimal point (quantities, VAT rates).
fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// en-GB short date. Accepts RFC 3339 timestamps or bare `YYYY-MM-DD`; anything
/// else passes through unchanged.
fn format_date_gb(raw: &str) -> String {
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    if let Ok(dt) = OffsetDateTime::parse(raw, &Rfc3339) {
        let d = dt.date();
        return format!("{:02}/{:02}/{:04}", d.day(), u8::from(d.month()), d.year());
    }
    let b = raw.as_bytes();
    if b.len() >= 10
        && b[..10].iter().all(|c| c.is_ascii())
        && b[4] == b'-'
        && b[7] == b'-'
        && b[..10].iter().filter(|c| c.is_ascii_digit()).count() == 8
    {
        return format!("{}/{}/{}", &raw[8..10], &raw[5..7], &raw[..4]);
    }
    raw.to_string()
}

/// Advance width in 1/1000 em from the standard Helvetica AFM metrics. Bold runs
/// slightly wider but the regular table is close enough for right alignment.
fn helvetica_advance(ch: char) -> f32 {
    match ch {
        '0'..='9' | '#' | '$' | '?' | '_' | '£' => 556.0,
        ' ' | '!' | ',' | '.' | '/' | ':' | ';' | '[' | '\\' | ']' => 278.0,
        '"' => 355.0,
        '%' => 889.0,
        '&' => 667.0,
        '\'' => 191.0,
        '(' | ')' | '-' | '`' => 333.0,
        '*' => 389.0,
        '+' | '<' | '=' | '>' | '~' => 584.0,
        '@' => 1015.0,
        'A' | 'B' | 'E' | 'K' | 'P' | 'V' | 'X' | 'Y' => 667.0,
        'C' | 'D' | 'H' | 'N' | 'R' | 'U' => 722.0,
        'F' | 'T' | 'Z' => 611.0,
        'G' | 'O' | 'Q' => 778.0,
        'I' => 278.0,
        'J' => 500.0,
        'L' => 556.0,
        'M' => 833.0,
        'S' => 667.0,
        'W' => 944.0,
        'a' | 'b' | 'd' | 'e' | 'g' | 'h' | 'n' | 'o' | 'p' | 'q' | 'u' => 556.0,
        'c' | 'k' | 's' | 'v' | 'x' | 'y' | 'z' => 500.0,
        'f' | 't' => 278.0,
        'i' | 'j' | 'l' => 222.0,
        'm' => 833.0,
        'r' => 333.0,
        'w' => 722.0,
        '{' | '}' => 334.0,
        '|' => 260.0,
        '^' => 469.0,
        _ => 556.0,
    }
}

fn text_width_mm(text: &str, font_size_pt: f32) -> f32 {
    // PDF font sizes are in points; our coordinates are in millimeters.
    const PT_TO_MM: f32 = 25.4 / 72.0;
    let units: f32 = text.chars().map(helvetica_advance).sum();
    units / 1000.0 * font_size_pt * PT_TO_MM
}

// All draw helpers take a top-origin y; printpdf wants bottom-origin.
fn push_line(
    layer: &PdfLayerReference,
    font: &IndirectFontRef,
    text: &str,
    font_size: f32,
    x: f32,
    y_top: f32,
) {
    layer.use_text(text, font_size, Mm(x), Mm(PAGE_H - y_top), font);
}

fn push_line_right(
    layer: &PdfLayerReference,
    font: &IndirectFontRef,
    text: &str,
    font_size: f32,
    x_right: f32,
    y_top: f32,
) {
    let x = (x_right - text_width_mm(text, font_size)).max(0.0);
    push_line(layer, font, text, font_size, x, y_top);
}

fn draw_rule(layer: &PdfLayerReference, x1: f32, x2: f32, y_top: f32) {
    let y = PAGE_H - y_top;
    layer.add_line(printpdf::Line {
        points: vec![
            (printpdf::Point::new(Mm(x1), Mm(y)), false),
            (printpdf::Point::new(Mm(x2), Mm(y)), false),
        ],
        is_closed: false,
    });
}

fn fill_rect_gray(layer: &PdfLayerReference, x: f32, y_top: f32, w: f32, h: f32, gray: f32) {
    layer.set_fill_color(Color::Rgb(Rgb::new(gray, gray, gray, None)));
    let top = PAGE_H - y_top;
    let rect = Rect::new(Mm(x), Mm(top - h), Mm(x + w), Mm(top)).with_mode(PaintMode::Fill);
    layer.add_rect(rect);
    // reset fill to black for subsequent text
    layer.set_fill_color(Color::Rgb(Rgb::new(0.0, 0.0, 0.0, None)));
}

/// Decode a data URL (data:image/*;base64,...) as stored from the UI upload.
fn decode_data_url_image(s: &str) -> Option<printpdf::image_crate::DynamicImage> {
    use base64::Engine as _;

    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let lower = s.to_ascii_lowercase();
    if !lower.starts_with("data:") {
        return None;
    }
    let comma = s.find(',')?;
    let (meta, data) = s.split_at(comma);
    if !meta.to_ascii_lowercase().contains(";base64") {
        return None;
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&data[1..])
        .ok()?;
    printpdf::image_crate::load_from_memory(&bytes).ok()
}

fn place_image(
    layer: &PdfLayerReference,
    img: &printpdf::image_crate::DynamicImage,
    x: f32,
    y_top: f32,
    w_mm: f32,
    h_mm: f32,
) {
    let px_w = img.width().max(1) as f32;
    let px_h = img.height().max(1) as f32;
    let natural_w_mm = px_w / IMAGE_DPI * 25.4;
    let natural_h_mm = px_h / IMAGE_DPI * 25.4;

    let image = Image::from_dynamic_image(img);
    image.add_to_layer(
        layer.clone(),
        ImageTransform {
            translate_x: Some(Mm(x)),
            translate_y: Some(Mm(PAGE_H - y_top - h_mm)),
            rotate: None,
            scale_x: Some(w_mm / natural_w_mm.max(0.01)),
            scale_y: Some(h_mm / natural_h_mm.max(0.01)),
            dpi: Some(IMAGE_DPI),
        },
    );
}

pub fn generate_pdf_bytes(
    invoice: &Invoice,
    settings: &Settings,
    client: Option<&Client>,
) -> Result<Vec<u8>, String> {
    let (doc, page1, layer1) = PdfDocument::new("Invoice", Mm(PAGE_W), Mm(PAGE_H), "Layer 1");
    let font = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| e.to_string())?;
    let font_bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(|e| e.to_string())?;
    let mut layer = doc.get_page(page1).get_layer(layer1);

    let mut y = 20.0_f32;

    // Header: optional logo on the left, company block right-aligned.
    if let Some(logo) = settings.logo.as_deref() {
        if let Some(img) = decode_data_url_image(logo) {
            place_image(&layer, &img, MARGIN_X, y, 40.0, 40.0);
        }
    }

    push_line_right(&layer, &font_bold, &settings.company_name, 18.0, COMPANY_RIGHT_X, y);
    y += 8.0;
    for line in settings.company_address.lines() {
        push_line_right(&layer, &font, line, 9.0, COMPANY_RIGHT_X, y);
        y += 4.0;
    }
    if !settings.email.is_empty() {
        push_line_right(
            &layer,
            &font,
            &format!("Email: {}", settings.email),
            9.0,
            COMPANY_RIGHT_X,
            y,
        );
        y += 4.0;
    }
    if !settings.phone.is_empty() {
        push_line_right(
            &layer,
            &font,
            &format!("Phone: {}", settings.phone),
            9.0,
            COMPANY_RIGHT_X,
            y,
        );
        y += 4.0;
    }
    if !settings.vat_number.is_empty() {
        push_line_right(
            &layer,
            &font,
            &format!("VAT: {}", settings.vat_number),
            9.0,
            COMPANY_RIGHT_X,
            y,
        );
    }

    // Title and invoice metadata start at a fixed offset regardless of header height.
    y = 80.0;
    push_line(&layer, &font_bold, "INVOICE", 24.0, MARGIN_X, y);

    y += 12.0;
    push_line(
        &layer,
        &font,
        &format!("Invoice No: {}", invoice.invoice_no),
        10.0,
        MARGIN_X,
        y,
    );
    push_line(
        &layer,
        &font,
        &format!("Date: {}", format_date_gb(&invoice.issue_date)),
        10.0,
        MARGIN_X,
        y + 6.0,
    );
    if let Some(due) = invoice.due_date.as_deref() {
        push_line(
            &layer,
            &font,
            &format!("Due Date: {}", format_date_gb(due)),
            10.0,
            MARGIN_X,
            y + 12.0,
        );
    }

    // Bill-to block. A deleted client leaves the block empty (weak reference).
    y += 25.0;
    push_line(&layer, &font_bold, "Bill To:", 10.0, MARGIN_X, y);
    y += 6.0;
    if let Some(client) = client {
        push_line(&layer, &font, &client.name, 10.0, MARGIN_X, y);
        if !client.company.is_empty() {
            y += 5.0;
            push_line(&layer, &font, &client.company, 10.0, MARGIN_X, y);
        }
        for line in client.address.lines() {
            y += 5.0;
            push_line(&layer, &font, line, 10.0, MARGIN_X, y);
        }
        if !client.email.is_empty() {
            y += 5.0;
            push_line(&layer, &font, &client.email, 10.0, MARGIN_X, y);
        }
        if !client.vat_number.is_empty() {
            y += 5.0;
            push_line(&layer, &font, &format!("VAT: {}", client.vat_number), 10.0, MARGIN_X, y);
        }
    }

    // Item table header band.
    y += 15.0;
    fill_rect_gray(&layer, MARGIN_X, y, TABLE_W, 8.0, 240.0 / 255.0);
    push_line(&layer, &font_bold, "Description", 9.0, 17.0, y + 5.0);
    push_line(&layer, &font_bold, "Qty", 9.0, 120.0, y + 5.0);
    push_line(&layer, &font_bold, "Price", 9.0, 140.0, y + 5.0);
    push_line(&layer, &font_bold, "VAT%", 9.0, 160.0, y + 5.0);
    push_line_right(&layer, &font_bold, "Total", 9.0, 180.0, y + 5.0);
    y += 12.0;

    for item in &invoice.items {
        if y > PAGE_BREAK_Y {
            let (page, layer_idx) = doc.add_page(Mm(PAGE_W), Mm(PAGE_H), "Layer 1");
            layer = doc.get_page(page).get_layer(layer_idx);
            y = 20.0;
        }

        push_line(&layer, &font, &item.description, 9.0, 17.0, y);
        push_line(&layer, &font, &format_number(item.quantity), 9.0, 120.0, y);
        push_line(&layer, &font, &format_amount(item.unit_price), 9.0, 140.0, y);
        push_line(&layer, &font, &format!("{}%", format_number(item.vat_rate)), 9.0, 160.0, y);
        push_line_right(
            &layer,
            &font,
            &format_amount(line_display_total(item)),
            9.0,
            VALUE_RIGHT_X,
            y,
        );
        y += 8.0;
    }

    // Totals block, right-aligned against the table edge.
    y += 10.0;
    draw_rule(&layer, 130.0, 195.0, y);
    y += 8.0;

    push_line(&layer, &font, "Subtotal:", 9.0, 150.0, y);
    push_line_right(&layer, &font, &format_amount(invoice.subtotal), 9.0, VALUE_RIGHT_X, y);
    y += 6.0;

    push_line(&layer, &font, "VAT Total:", 9.0, 150.0, y);
    push_line_right(&layer, &font, &format_amount(invoice.vat_total), 9.0, VALUE_RIGHT_X, y);
    y += 8.0;

    push_line(&layer, &font_bold, "Total:", 11.0, 150.0, y);
    push_line_right(&layer, &font_bold, &format_amount(invoice.total), 11.0, VALUE_RIGHT_X, y);

    // Footer: payment terms, bank details, optional signature.
    y += 20.0;
    if !settings.payment_terms.is_empty() {
        push_line(&layer, &font_bold, "Payment Terms:", 9.0, MARGIN_X, y);
        y += 5.0;
        for line in settings.payment_terms.lines() {
            push_line(&layer, &font, line, 9.0, MARGIN_X, y);
            y += 4.0;
        }
    }

    if !settings.bank_details.is_empty() {
        y += 5.0;
        push_line(&layer, &font_bold, "Bank Details:", 9.0, MARGIN_X, y);
        y += 5.0;
        for line in settings.bank_details.lines() {
            push_line(&layer, &font, line, 9.0, MARGIN_X, y);
            y += 4.0;
        }
    }

    if y < 260.0 {
        if let Some(sig) = settings.signature.as_deref() {
            if let Some(img) = decode_data_url_image(sig) {
                place_image(&layer, &img, MARGIN_X, y + 5.0, 40.0, 20.0);
            }
        }
    }

    let mut writer = std::io::BufWriter::new(Vec::<u8>::new());
    doc.save(&mut writer).map_err(|e| e.to_string())?;
    let bytes = writer.into_inner().map_err(|e| e.to_string())?;
    Ok(bytes)
}
