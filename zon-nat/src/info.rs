/// Fixed width text table used by the list and stats commands.
pub struct InfoTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl InfoTable {
    pub fn new(header: Vec<&str>) -> Self {
        Self {
            header: header.iter().map(|h| h.to_string()).collect(),
            rows: vec![],
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.header.iter().map(|h| h.len()).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                match widths.get_mut(i) {
                    Some(w) => *w = (*w).max(cell.len()),
                    None => widths.push(cell.len()),
                }
            }
        }
        widths
    }

    fn format_row(cells: &[String], widths: &[usize]) -> String {
        widths
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let cell = cells.get(i).map(String::as_str).unwrap_or_default();
                format!("{:<w$}", cell, w = w)
            })
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    }

    pub fn render(&self, title: &str) -> String {
        let widths = self.widths();
        let header = Self::format_row(&self.header, &widths);
        let line_len = widths.iter().sum::<usize>() + 2 * widths.len().saturating_sub(1);
        let mut out = String::new();

        if !title.is_empty() {
            out.push_str(&format!("{title}\n"));
        }
        out.push_str(&format!("{header}\n{0:-<1$}\n", "-", line_len));
        for row in &self.rows {
            out.push_str(&Self::format_row(row, &widths));
            out.push('\n');
        }
        out
    }

    pub fn print(&self, title: &str) {
        print!("{}", self.render(title));
    }
}
